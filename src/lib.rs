//! # notch - Network Device Session Agent
//!
//! `notch` runs commands against routers, switches and firewalls through a
//! uniform request/response API while keeping one persistent CLI session
//! per device. Sessions are expensive to set up on low-powered device CPUs,
//! so they are cached, reused, idled out when unused and re-established
//! once when the transport drops underneath a request.
//!
//! ## Features
//!
//! - **Session Caching**: at most one live session per device, shared by
//!   queued callers
//! - **Three Transports**: SSH exec channels (JunOS), expect-style SSH
//!   shells and expect-style telnet
//! - **Vendor Dialects**: IOS, TiMOS, FTOS, ScreenOS, Nortel, Omniswitch,
//!   Arbor, ADVA, NOS and BiNOS prompt and login handling
//! - **Last-Match Credentials**: regexp-selected credentials, later rules
//!   override earlier ones, no match fails closed
//! - **Client Dispatcher**: asynchronous requests with callbacks, bulk wait
//!   and cancellation, round-robin or latency-aware agent selection
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use notch::agent::Agent;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let agent = Agent::from_config_file("notch.yaml")?;
//!     agent.start_maintenance();
//!
//!     for device in agent.devices_matching("^ar.*")? {
//!         let output = agent.command(&device, "show version", None).await?;
//!         println!("{device}: {output}");
//!     }
//!
//!     agent.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`agent::Agent`] - The request surface: devices_matching, devices_info,
//!   command, get_config, set_config
//! - [`session::SessionManager`] - Session cache, idle eviction and retry
//! - [`driver::DeviceDriver`] - Transport/vendor drivers behind one contract
//! - [`credential::CredentialStore`] - Last-match credential resolution
//! - [`client::Client`] - Asynchronous dispatcher over several agents
//! - [`error::AgentError`] - Error taxonomy shared by every layer

pub mod agent;
pub mod client;
pub mod config;
pub mod credential;
pub mod device;
pub mod driver;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod rpc;
pub mod session;
pub mod templates;
