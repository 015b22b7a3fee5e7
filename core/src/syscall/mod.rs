#[macro_use]
pub mod macros;
pub mod common;
pub mod context;
pub mod dispatch;
pub mod handlers;
pub mod process;

pub use common::{SyscallEntry, SyscallResult};
pub use dispatch::{sendsys, sendsys_as, sendsys_async, sys_dispatch, sysmsg_init, sysmsg_result};
pub use process::{Cred, Process, SysCompletion};
