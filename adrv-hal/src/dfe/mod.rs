/*!
Digital front-end DSP blocks: DPD, CFR and CLGC.

Each block is driven through the co-processor mailbox and is reached by
mutably borrowing a [`Device`][crate::Device]:

```
use adrv_hal::dfe::TxChannels;
use adrv_hal::dfe::clgc::ClgcConfig;
use adrv_hal::{sim::SimHal, Device};

# fn main() -> Result<(), adrv_hal::Error> {
let mut device = Device::new(SimHal::new());
let cfg = ClgcConfig {
    enable: true,
    ..ClgcConfig::default()
};
device.clgc().set_config(TxChannels::TX0 | TxChannels::TX2, &cfg)?;
# Ok(())
# }
```

Operations taking a [`TxChannels`] set are applied one channel at a time, in
ascending order, and stop at the first failure. Operations that read state
back take a single Tx channel index, `0..=7`.
*/

use crate::consts::NUM_TX_CHANNELS;
use crate::flags::bit_flags;
use crate::profile::layout::Field;
use crate::Error;

pub mod cfr;
pub mod clgc;
pub mod dpd;

bit_flags! {
    /// A set of Tx channels.
    pub struct TxChannels: u8 {
        /// Tx channel 0.
        const TX0 = 0x01;
        /// Tx channel 1.
        const TX1 = 0x02;
        /// Tx channel 2.
        const TX2 = 0x04;
        /// Tx channel 3.
        const TX3 = 0x08;
        /// Tx channel 4.
        const TX4 = 0x10;
        /// Tx channel 5.
        const TX5 = 0x20;
        /// Tx channel 6.
        const TX6 = 0x40;
        /// Tx channel 7.
        const TX7 = 0x80;
    }
}

impl TxChannels {
    /// The set holding only channel `tx`.
    ///
    /// # Errors
    ///
    /// [`Error::ValueRange`] if `tx` is not a Tx channel index.
    pub fn single(tx: usize) -> Result<Self, Error> {
        check_tx(tx)?;
        Ok(Self(1 << tx))
    }

    /// Channel indices in the set, ascending.
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..NUM_TX_CHANNELS).filter(|i| self.0 & (1 << i) != 0)
    }

    /// Reject an empty set, since it would silently do nothing.
    pub(crate) fn non_empty(self) -> Result<Self, Error> {
        if self.is_empty() {
            Err(Error::InvalidParameter("no Tx channel selected"))
        } else {
            Ok(self)
        }
    }
}

pub(crate) fn check_tx(tx: usize) -> Result<(), Error> {
    if tx >= NUM_TX_CHANNELS {
        return Err(Error::value_range(0..NUM_TX_CHANNELS as u32, tx as u32));
    }
    Ok(())
}

/// Decode a field out of a co-processor response. A short response is bad
/// return data, not a caller error.
pub(crate) fn field(buf: &[u8], f: Field) -> Result<u64, Error> {
    f.decode(buf).map_err(|_| Error::ReturnData)
}

/// Encode a field into a co-processor request buffer sized by the caller.
pub(crate) fn put(buf: &mut [u8], f: Field, v: u64) -> Result<(), Error> {
    f.encode(buf, v).map_err(|_| Error::ReturnData)
}

pub(crate) fn field_f32(buf: &[u8], f: Field) -> Result<f32, Error> {
    Ok(f32::from_bits(field(buf, f)? as u32))
}

/// Prefix a tracking-cal payload with its `{offset, length}` header.
pub(crate) fn windowed(offset: u8, body: &[u8]) -> Result<Vec<u8>, Error> {
    let len: u8 = body
        .len()
        .try_into()
        .map_err(|_| Error::InvalidParameter("tracking payload longer than 255 bytes"))?;
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(offset);
    out.push(len);
    out.extend_from_slice(body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_channel_sets() {
        let set = TxChannels::TX1 | TxChannels::TX3;
        assert_eq!(set.indices().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(TxChannels::single(2).unwrap(), TxChannels::TX2);
        assert_eq!(TxChannels::single(5).unwrap(), TxChannels::TX5);
        assert!(TxChannels::single(8).is_err());
        assert!(TxChannels::empty().non_empty().is_err());
        assert_eq!(TxChannels::all().indices().count(), 8);
        assert_eq!(
            (TxChannels::TX4 | TxChannels::TX7).indices().collect::<Vec<_>>(),
            vec![4, 7]
        );
    }

    #[test]
    fn windowed_header() {
        assert_eq!(windowed(8, &[1, 2]).unwrap(), vec![8, 2, 1, 2]);
        assert!(windowed(0, &[0; 256]).is_err());
    }
}
