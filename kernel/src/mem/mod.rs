pub mod pagedir;
pub mod palloc;
pub mod user;

pub use pagedir::PageDirectory;
pub use palloc::{PalFlags, UserPool};
