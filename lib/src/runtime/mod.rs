//! Container composition and supervision.

mod app;
mod composer;
mod container;
mod dbus_proxy;
pub mod oci;

pub use app::{default_exec_args, load_layout, write_app_config, RunningApp};
pub use composer::{AppLayout, Composer, DbusOptions, RunOptions};
pub use container::Container;
pub use dbus_proxy::{load_filter, DbusFilter};
