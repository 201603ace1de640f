//! Honeypot agent
//!
//! Runs a set of decoy services (SSH, Telnet, FTP, Redis, Docker API,
//! Kubernetes components, HTTP proxy, Elasticsearch, TFTP and a bash socket),
//! reports every interaction to a central server and follows the server's
//! service and task instructions.

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod monitor;
pub mod pool;
pub mod report;
pub mod session;
pub mod tasks;
