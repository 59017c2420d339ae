//! # shoal-state
//!
//! Records the scheduler and the host agents exchange through the
//! coordination store.
//!
//! ## Layout
//!
//! Everything lives under `/pools/{pool}`:
//!
//! ```text
//! /pools/{pool}/services/{service}                  ServiceNode
//! /pools/{pool}/services/{service}/{state_id}       ServiceState (service half)
//! /pools/{pool}/hosts/{host}                        HostNode
//! /pools/{pool}/hosts/{host}/instances/{state_id}   HostState (host half)
//! /pools/{pool}/hosts/{host}/online/{marker}        ephemeral liveness marker
//! /pools/{pool}/hosts/{host}/ips/{ip_id}            HostIp (host half)
//! /pools/{pool}/ips/{ip_id}                         PoolIp (pool half)
//! /pools/{pool}/virtualips/{ip}                     VirtualIp declaration
//! ```
//!
//! ## Pairing
//!
//! An instance state is one record split across a host half and a service
//! half. Both halves are created, updated and deleted in a single
//! transaction. A half found without its counterpart is an orphan and is
//! removed by the `clean_*` functions. IP bindings follow the same rules.

mod error;
mod host;
mod ip;
pub mod paths;
mod service;
mod state;
mod store;

pub use error::{ErrorKind, InvalidStateId, IpError, StateError};
pub use host::{
    add_host, get_host, get_hosts, is_host_locked, is_host_online, register_online, remove_host, sync_hosts,
    unregister_online, update_host, HostNode,
};
pub use ip::{
    add_virtual_ip, create_ip, delete_ip, get_host_ips, get_ip, get_pool_ips, ip_id, parse_ip_id,
    remove_virtual_ip, sync_virtual_ips, update_ip, HostIp, Ip, IpRequest, PoolIp, VirtualIp,
};
pub use service::{
    get_service, lock_services, pause_service, remove_service, set_service_lock, start_service,
    stop_service, sync_services, unlock_services, update_service, ChangeOption, ServiceNode,
};
pub use state::{
    parse_state_id, sort_requests, DesiredState, HostState, ServiceState, State, StateRequest,
};
pub use store::{
    clean_host_states, clean_service_states, create_state, delete_host_states,
    delete_host_states_when, delete_service_states, delete_state, get_host_state_ids,
    get_host_states, get_service_state_ids, get_service_states, get_state, is_valid_state,
    monitor_state, update_state,
};
