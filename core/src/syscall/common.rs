use lwkt_abi::error::KResult;

use super::context::SyscallContext;

pub type SyscallResult = KResult<u64>;

pub type SyscallHandler = fn(&SyscallContext) -> SyscallResult;

#[derive(Copy, Clone)]
pub struct SyscallEntry {
    pub handler: Option<SyscallHandler>,
    pub name: &'static str,
}

impl SyscallEntry {
    pub const EMPTY: SyscallEntry = SyscallEntry {
        handler: None,
        name: "",
    };
}

impl core::fmt::Debug for SyscallEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyscallEntry")
            .field("name", &self.name)
            .field("implemented", &self.handler.is_some())
            .finish()
    }
}
