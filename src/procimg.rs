//! Process image: the register bank the server-side message codec reads and
//! writes. The engine only depends on the [`ProcessImage`] trait; the
//! in-memory [`SimpleProcessImage`] backs tests and simulated devices.

use std::sync::RwLock;

use thiserror::Error;

/// An access outside the addressable register space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal data address: {reference}+{count}")]
pub struct IllegalAddress {
    /// First addressed element.
    pub reference: u16,
    /// Number of elements requested.
    pub count: u16,
}

/// Accessor for the process values a slave exposes.
///
/// Implementations must be safe for concurrent access from multiple
/// connection handlers.
pub trait ProcessImage: Send + Sync {
    /// Read `count` holding registers starting at `reference`.
    fn holding_registers(&self, reference: u16, count: u16) -> Result<Vec<u16>, IllegalAddress>;

    /// Read `count` input registers starting at `reference`.
    fn input_registers(&self, reference: u16, count: u16) -> Result<Vec<u16>, IllegalAddress>;

    /// Write one holding register.
    fn set_holding_register(&self, reference: u16, value: u16) -> Result<(), IllegalAddress>;
}

#[derive(Debug, Default)]
struct ImageState {
    holding: Vec<u16>,
    input: Vec<u16>,
}

/// In-memory process image with fixed-size register banks.
#[derive(Debug, Default)]
pub struct SimpleProcessImage {
    state: RwLock<ImageState>,
}

impl SimpleProcessImage {
    /// Create an image with `holding` holding registers and `input` input
    /// registers, all initialized to zero.
    pub fn with_size(holding: usize, input: usize) -> Self {
        Self {
            state: RwLock::new(ImageState {
                holding: vec![0; holding],
                input: vec![0; input],
            }),
        }
    }

    /// Overwrite an input register, e.g. from a sampling task.
    pub fn set_input_register(&self, reference: u16, value: u16) -> Result<(), IllegalAddress> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let slot = state
            .input
            .get_mut(reference as usize)
            .ok_or(IllegalAddress {
                reference,
                count: 1,
            })?;
        *slot = value;
        Ok(())
    }

    fn range(bank: &[u16], reference: u16, count: u16) -> Result<Vec<u16>, IllegalAddress> {
        let start = reference as usize;
        let end = start + count as usize;
        bank.get(start..end)
            .map(<[u16]>::to_vec)
            .ok_or(IllegalAddress { reference, count })
    }
}

impl ProcessImage for SimpleProcessImage {
    fn holding_registers(&self, reference: u16, count: u16) -> Result<Vec<u16>, IllegalAddress> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Self::range(&state.holding, reference, count)
    }

    fn input_registers(&self, reference: u16, count: u16) -> Result<Vec<u16>, IllegalAddress> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Self::range(&state.input, reference, count)
    }

    fn set_holding_register(&self, reference: u16, value: u16) -> Result<(), IllegalAddress> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let slot = state
            .holding
            .get_mut(reference as usize)
            .ok_or(IllegalAddress {
                reference,
                count: 1,
            })?;
        *slot = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_read() {
        let image = SimpleProcessImage::with_size(10, 0);
        image.set_holding_register(3, 0x1234).unwrap();

        let regs = image.holding_registers(2, 3).unwrap();
        assert_eq!(regs, vec![0, 0x1234, 0]);
    }

    #[test]
    fn test_out_of_range_read() {
        let image = SimpleProcessImage::with_size(10, 10);
        let err = image.holding_registers(8, 5).unwrap_err();
        assert_eq!(
            err,
            IllegalAddress {
                reference: 8,
                count: 5
            }
        );
        assert!(image.input_registers(10, 1).is_err());
    }

    #[test]
    fn test_write_bounds() {
        let image = SimpleProcessImage::with_size(4, 4);
        assert!(image.set_holding_register(3, 1).is_ok());
        assert!(image.set_holding_register(4, 1).is_err());
        assert!(image.set_input_register(2, 7).is_ok());
        assert_eq!(image.input_registers(2, 1).unwrap(), vec![7]);
    }
}
