//! Appliance Session Client
//!
//! Everything needed to talk to the appliance management API: typed
//! commands, the authenticated session, the HTTP transport and an
//! in-memory appliance for tests and dry runs.

pub mod command;
pub mod objects;
pub mod session;
pub mod simulator;
pub mod transport;

pub use command::ApplianceCommand;
pub use session::{Credentials, SessionClient, SessionConfig};
pub use simulator::{Fault, FaultRule, InMemoryAppliance, SimulatorConfig};
pub use transport::{ApplianceTransport, ApplianceTransportRef, HttpMethod, HttpTransport};
