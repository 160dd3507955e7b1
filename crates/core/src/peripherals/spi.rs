//! Serial transfer primitive between the QUADSPI controller and its target.
//!
//! The bus is modelled as a plain synchronous call: the controller shifts one
//! byte out and gets the byte clocked back in during the same call. Line count
//! (single/dual/quad) does not change what is exchanged, so it is not part of
//! the interface. Chip-select framing is explicit: every transaction is
//! bracketed by `set_cs(true)` ... `set_cs(false)`.

/// A device sitting on the serial bus behind the controller.
pub trait SpiSlave {
    /// Full-duplex exchange of one byte. Returns the byte driven by the target.
    fn transfer(&mut self, tx: u8) -> u8;

    /// Drive the chip-select line. `true` means selected (nCS low).
    fn set_cs(&mut self, asserted: bool);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::SpiSlave;

    /// One observed bus event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum BusEvent {
        Cs(bool),
        Byte(u8),
    }

    /// Slave that records every event and answers from a script
    /// (0 once the script runs dry).
    #[derive(Default)]
    pub struct RecordingSlave {
        pub events: Vec<BusEvent>,
        pub responses: std::collections::VecDeque<u8>,
    }

    impl RecordingSlave {
        pub fn sent(&self) -> Vec<u8> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    BusEvent::Byte(b) => Some(*b),
                    _ => None,
                })
                .collect()
        }

        pub fn selects(&self) -> usize {
            self.events.iter().filter(|e| **e == BusEvent::Cs(true)).count()
        }
    }

    impl SpiSlave for RecordingSlave {
        fn transfer(&mut self, tx: u8) -> u8 {
            self.events.push(BusEvent::Byte(tx));
            self.responses.pop_front().unwrap_or(0)
        }

        fn set_cs(&mut self, asserted: bool) {
            self.events.push(BusEvent::Cs(asserted));
        }
    }
}
