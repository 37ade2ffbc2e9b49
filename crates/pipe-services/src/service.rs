use std::io::{self, Write};

use goldfish_pipe::{ChannelKey, CloseReason, PipeResult, PollFlags, WakeFlags};

use crate::waker::HostWaker;

/// A named kind of host pipe the guest can connect to with `pipe:<name>[:<args>]`.
pub trait PipeService {
    fn name(&self) -> &str;

    /// Creates the host end of a freshly connected channel. `None` rejects the connection.
    fn create(
        &mut self,
        key: ChannelKey,
        args: Option<&str>,
        waker: HostWaker,
    ) -> Option<Box<dyn ServicePipe>>;

    /// Whether pipes of this service survive a snapshot.
    fn can_load(&self) -> bool {
        false
    }

    /// Rebuilds a pipe from the bytes its [`ServicePipe::save`] wrote.
    fn load(
        &mut self,
        _key: ChannelKey,
        _args: Option<&str>,
        _state: &[u8],
        _waker: HostWaker,
    ) -> Option<Box<dyn ServicePipe>> {
        None
    }

    fn pre_save(&mut self) {}
    fn post_save(&mut self) {}
    fn pre_load(&mut self) {}
    fn post_load(&mut self) {}
}

/// The host end of one connected channel.
pub trait ServicePipe {
    fn close(&mut self, _reason: CloseReason) {}

    fn send(&mut self, buffers: &[&[u8]]) -> PipeResult<usize>;

    fn recv(&mut self, buffers: &mut [&mut [u8]]) -> PipeResult<usize>;

    fn poll(&self) -> PollFlags;

    /// Arms `flags`. The pipe reports each one through its [`HostWaker`] once it holds.
    fn wake_on(&mut self, flags: WakeFlags);

    fn save(&self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }
}
