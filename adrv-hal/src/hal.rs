/*!
Register-access seam between the driver and the hardware.

Everything the driver does to the transceiver goes through the [`Hal`] trait:
single register reads and writes, bulk memory transfers, SPI streaming mode,
and waiting. Platform code implements it on top of whatever SPI controller is
present; [`SimHal`][crate::sim::SimHal] implements it in memory for tests.

Bulk writes should be wrapped in a [`StreamingGuard`], which enters SPI
streaming mode and is guaranteed to leave it again, even when the write fails
part-way:

```
use adrv_hal::hal::{Hal, StreamingGuard};
use adrv_hal::sim::SimHal;

# fn main() -> Result<(), adrv_hal::Error> {
let mut hal = SimHal::new();
let mut stream = StreamingGuard::enter(&mut hal)?;
stream.write_bytes(0x2000_0000, &[1, 2, 3, 4])?;
stream.finish()?;
assert!(!hal.is_streaming());
# Ok(())
# }
```
*/

use std::ops::{Deref, DerefMut};

use tracing::{trace, warn};

use crate::Error;

/// Access to the transceiver's registers and memory.
///
/// Addresses below `0x0001_0000` are direct SPI registers; everything else is
/// AHB memory reached indirectly. Implementations decide how to route them.
/// Multi-byte accessors use the device byte order.
///
/// The default bulk accessors fall back to single-byte transactions.
/// Implementations should override them with burst transfers where the bus
/// supports it.
pub trait Hal {
    /// Read one byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interface`] if the bus transaction fails.
    fn read_u8(&mut self, addr: u32) -> Result<u8, Error>;

    /// Write one byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interface`] if the bus transaction fails.
    fn write_u8(&mut self, addr: u32, val: u8) -> Result<(), Error>;

    /// Read a 32-bit word.
    fn read_u32(&mut self, addr: u32) -> Result<u32, Error> {
        let mut b = [0u8; 4];
        self.read_bytes(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Write a 32-bit word.
    fn write_u32(&mut self, addr: u32, val: u32) -> Result<(), Error> {
        self.write_bytes(addr, &val.to_le_bytes())
    }

    /// Fill `buf` from consecutive addresses starting at `addr`.
    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_u8(addr.wrapping_add(i as u32))?;
        }
        Ok(())
    }

    /// Write `data` to consecutive addresses starting at `addr`.
    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        for (i, b) in data.iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), *b)?;
        }
        Ok(())
    }

    /// Enter or leave SPI streaming mode.
    ///
    /// Buses without a streaming mode can leave this as a no-op.
    fn set_streaming(&mut self, enable: bool) -> Result<(), Error> {
        let _ = enable;
        Ok(())
    }

    /// Block for `us` microseconds.
    ///
    /// This is the only way the driver waits, so a test implementation can
    /// advance a virtual clock instead of sleeping.
    fn wait_us(&mut self, us: u32);
}

impl<H: Hal + ?Sized> Hal for &mut H {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Error> {
        (**self).read_u8(addr)
    }
    fn write_u8(&mut self, addr: u32, val: u8) -> Result<(), Error> {
        (**self).write_u8(addr, val)
    }
    fn read_u32(&mut self, addr: u32) -> Result<u32, Error> {
        (**self).read_u32(addr)
    }
    fn write_u32(&mut self, addr: u32, val: u32) -> Result<(), Error> {
        (**self).write_u32(addr, val)
    }
    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        (**self).read_bytes(addr, buf)
    }
    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        (**self).write_bytes(addr, data)
    }
    fn set_streaming(&mut self, enable: bool) -> Result<(), Error> {
        (**self).set_streaming(enable)
    }
    fn wait_us(&mut self, us: u32) {
        (**self).wait_us(us)
    }
}

/// Read-modify-write the bits of `mask` in a 32-bit register.
pub(crate) fn modify_u32<H: Hal + ?Sized>(
    hal: &mut H,
    addr: u32,
    mask: u32,
    val: u32,
) -> Result<(), Error> {
    let old = hal.read_u32(addr)?;
    hal.write_u32(addr, (old & !mask) | (val & mask))
}

/// Write `data` to `addr` in chunks of `chunk_size` bytes.
///
/// After every chunk, an optional callback will be invoked with the number of
/// bytes written so far as the first argument, and the total number of bytes
/// as the second.
pub(crate) fn write_chunked<H, F>(
    hal: &mut H,
    addr: u32,
    data: &[u8],
    chunk_size: usize,
    mut callback: Option<F>,
) -> Result<(), Error>
where
    H: Hal + ?Sized,
    F: FnMut(usize, usize),
{
    let total = data.len();
    let mut sent = 0;
    for chunk in data.chunks(chunk_size) {
        hal.write_bytes(addr.wrapping_add(sent as u32), chunk)?;
        sent += chunk.len();
        trace!("wrote {sent}/{total} bytes at 0x{addr:08x}");
        if let Some(ref mut c) = callback {
            c(sent, total);
        }
    }
    Ok(())
}

/// Scoped SPI streaming mode.
///
/// Entering the guard turns streaming on; dropping it turns streaming off
/// again, exactly once, on every exit path. Call [`finish`][Self::finish] to
/// find out whether leaving streaming mode worked; a plain drop can only log
/// the failure.
///
/// The guard dereferences to the underlying [`Hal`], so bulk writes go
/// through it directly.
pub struct StreamingGuard<'a, H: Hal + ?Sized> {
    hal: &'a mut H,
    active: bool,
}

impl<'a, H: Hal + ?Sized> StreamingGuard<'a, H> {
    /// Turn on SPI streaming mode.
    ///
    /// # Errors
    ///
    /// Fails if the HAL can't enter streaming mode, in which case nothing
    /// needs to be cleaned up.
    pub fn enter(hal: &'a mut H) -> Result<Self, Error> {
        hal.set_streaming(true)?;
        trace!("SPI streaming enabled");
        Ok(Self { hal, active: true })
    }

    /// Leave streaming mode, reporting failure.
    ///
    /// # Errors
    ///
    /// A failure to leave streaming mode leaves the register interface in an
    /// unknown mode, and is reported as [`Error::Interface`].
    pub fn finish(mut self) -> Result<(), Error> {
        self.active = false;
        self.exit()
    }

    fn exit(&mut self) -> Result<(), Error> {
        match self.hal.set_streaming(false) {
            Ok(()) => {
                trace!("SPI streaming disabled");
                Ok(())
            }
            Err(e) => {
                warn!("failed to leave SPI streaming mode: {e}");
                Err(Error::Interface("failed to leave SPI streaming mode"))
            }
        }
    }
}

impl<H: Hal + ?Sized> Deref for StreamingGuard<'_, H> {
    type Target = H;
    fn deref(&self) -> &H {
        self.hal
    }
}

impl<H: Hal + ?Sized> DerefMut for StreamingGuard<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        self.hal
    }
}

impl<H: Hal + ?Sized> Drop for StreamingGuard<'_, H> {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            let _ = self.exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Op, SimHal};

    #[test]
    fn guard_exits_on_drop() {
        let mut hal = SimHal::new();
        {
            let _g = StreamingGuard::enter(&mut hal).unwrap();
        }
        assert!(!hal.is_streaming());
        let toggles: Vec<_> = hal
            .ops()
            .iter()
            .filter(|op| matches!(op, Op::Streaming(_)))
            .cloned()
            .collect();
        assert_eq!(toggles, vec![Op::Streaming(true), Op::Streaming(false)]);
    }

    #[test]
    fn finish_reports_exit_failure() {
        let mut hal = SimHal::new();
        hal.fail_streaming_exit(true);
        let g = StreamingGuard::enter(&mut hal).unwrap();
        assert!(matches!(g.finish(), Err(Error::Interface(_))));
    }

    #[test]
    fn chunked_progress() {
        let mut hal = SimHal::new();
        let data: Vec<u8> = (0..10).collect();
        let mut seen = Vec::new();
        write_chunked(&mut hal, 0x100, &data, 4, Some(|n, t| seen.push((n, t)))).unwrap();
        assert_eq!(seen, vec![(4, 10), (8, 10), (10, 10)]);
        let mut back = [0u8; 10];
        hal.read_bytes(0x100, &mut back).unwrap();
        assert_eq!(&back[..], &data[..]);
    }

    #[test]
    fn modify_keeps_other_bits() {
        let mut hal = SimHal::new();
        hal.write_u32(0x40, 0xF0F0_0000).unwrap();
        modify_u32(&mut hal, 0x40, 0x0000_00FF, 0x12).unwrap();
        assert_eq!(hal.read_u32(0x40).unwrap(), 0xF0F0_0012);
    }
}
