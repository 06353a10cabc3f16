pub use crate::config::ClientConfig;
pub use crate::connection::{Connection, ConnectionListener};
pub use crate::machine::{SessionEvent, SessionState};
pub use crate::manager::ConnectionManager;
pub use ipmiproto::cipher::CipherSuite;
pub use ipmiproto::command::{CommandRequest, CommandResponse};
pub use ipmiproto::handshake::PrivilegeLevel;
pub use ipmiproto::shared::{IpmiError, IpmiResult};
