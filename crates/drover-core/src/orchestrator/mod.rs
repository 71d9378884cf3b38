mod traits;

pub use traits::{RestartSupervisor, Slot, UpdateSupervisor};
