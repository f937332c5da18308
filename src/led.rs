use anyhow::Result;

use crate::link::SerialLink;
use crate::protocol::{LedColor, LedCommand};

/// LED ring driven by the sibling firmware on the same board.
pub struct LedRing {
    link: SerialLink,
}

impl LedRing {
    pub fn new(link: SerialLink) -> LedRing {
        LedRing { link }
    }

    fn send(&self, command: LedCommand) -> Result<()> {
        self.link.send(&command.encode())
    }

    pub fn on(&self) -> Result<()> {
        self.brightness(255)
    }

    pub fn off(&self) -> Result<()> {
        self.send(LedCommand::Off)
    }

    pub fn brightness(&self, level: u8) -> Result<()> {
        self.send(LedCommand::Brightness(level))
    }

    pub fn color(&self, color: LedColor) -> Result<()> {
        self.send(LedCommand::Color(color))
    }

    pub fn rainbow(&self) -> Result<()> {
        self.send(LedCommand::Rainbow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testing::buffered_link;

    #[test]
    fn ring_commands() {
        let (link, buffer) = buffered_link();
        let ring = LedRing::new(link);
        ring.on().unwrap();
        ring.color(LedColor::parse("00ff00").unwrap()).unwrap();
        ring.brightness(12).unwrap();
        ring.rainbow().unwrap();
        ring.off().unwrap();
        assert_eq!(buffer.lines(), vec!["L255", "C00FF00", "L12", "R", "O"]);
    }
}
