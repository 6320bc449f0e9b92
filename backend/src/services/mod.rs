pub mod email;
pub mod entity_writer;

pub use email::{EmailSender, LogEmailSender, OutgoingEmail, SmtpEmailSender};
pub use entity_writer::{EntityWriter, MemoryEntityWriter, PgEntityWriter};
