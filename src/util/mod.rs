pub mod buf;
pub mod stop_signal;
pub mod tasks;
