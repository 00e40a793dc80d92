pub mod channels;
pub mod health;
pub mod mailboxes;
pub mod messages;
pub mod sync;
