pub mod accounts;
pub mod competition;
pub mod markets;
pub mod players;
pub mod session;
pub mod table;
pub mod ticket;
pub mod tickets;
pub mod user;

pub use tickets::TicketSettings;
pub use user::{User, UserSettings, UserStatus};
