mod layout;

pub use layout::{round_up, GuardedLayout};
