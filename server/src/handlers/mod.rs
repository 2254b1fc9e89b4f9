//! Request handlers behind the `/sync` routes.

mod logs;
mod pull;
mod push;
mod snapshot;

pub use logs::*;
pub use pull::*;
pub use push::*;
pub use snapshot::*;
