use bitflags::bitflags;

bitflags! {
    /// Events a channel reports to the guest through the signalled list.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WakeFlags: u8 {
        const CLOSED = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
    }
}

bitflags! {
    /// Readiness bits returned by a POLL command.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PollFlags: u32 {
        const IN = 1 << 0;
        const OUT = 1 << 1;
        const HUP = 1 << 2;
    }
}
