mod airbyte;
mod state;
mod stream;
mod table;

pub use airbyte::*;
pub use state::*;
pub use stream::*;
pub use table::*;
