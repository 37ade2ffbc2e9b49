/// A level-triggered interrupt line driven by a device model.
pub trait IrqLine {
    fn set_level(&self, level: bool);
}

/// Interrupt line that goes nowhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIrq;

impl IrqLine for NoIrq {
    fn set_level(&self, _level: bool) {}
}

/// The device's interrupt output. Only level changes reach the line.
pub(crate) struct InterruptPin {
    line: Box<dyn IrqLine>,
    level: bool,
}

impl InterruptPin {
    pub(crate) fn new(line: Box<dyn IrqLine>) -> Self {
        Self { line, level: false }
    }

    pub(crate) fn level(&self) -> bool {
        self.level
    }

    pub(crate) fn set(&mut self, level: bool) {
        if self.level != level {
            self.level = level;
            self.line.set_level(level);
        }
    }

    pub(crate) fn raise(&mut self) {
        self.set(true);
    }

    pub(crate) fn lower(&mut self) {
        self.set(false);
    }
}
