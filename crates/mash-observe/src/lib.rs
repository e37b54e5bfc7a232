mod logger;
pub use logger::*;

mod outstream;
pub use outstream::OutStream;

mod view;
pub use view::{log_transition, message_for};
