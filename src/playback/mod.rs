pub mod clock;
pub mod control;
pub mod output;
pub mod state;
pub mod sync;
