//! Byte layout of the binary device profile.
//!
//! Each field is a [`Field`] descriptor. Repeated sub-structures (per-slot
//! channel configs, bands, carriers) are described relative to their own
//! start and placed with [`Field::at`] and [`Field::nth`].
//!
//! All fields are little-endian.

use crate::codec::{decode_uint, ByteOrder, DEVICE_BYTE_ORDER};
use crate::Error;

/// One scalar or byte-array field in a binary structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    /// Name used in error reports.
    pub name: &'static str,
    /// Byte offset from the start of the enclosing structure.
    pub offset: u32,
    /// Width in bytes. Scalars are 1, 2, 4 or 8 bytes wide.
    pub width: u8,
    /// Byte order of multi-byte scalars.
    pub order: ByteOrder,
}

impl Field {
    /// A device-order field.
    pub const fn new(name: &'static str, offset: u32, width: u8) -> Self {
        Self {
            name,
            offset,
            width,
            order: DEVICE_BYTE_ORDER,
        }
    }

    /// The same field inside a structure starting at `base`.
    pub const fn at(self, base: u32) -> Self {
        Self {
            offset: base + self.offset,
            ..self
        }
    }

    /// The `i`th element of an array of `stride`-byte elements.
    pub const fn nth(self, i: u32, stride: u32) -> Self {
        Self {
            offset: self.offset + i * stride,
            ..self
        }
    }

    /// One past the last byte of this field.
    pub const fn end(&self) -> u32 {
        self.offset + self.width as u32
    }

    fn err(&self) -> Error {
        Error::ProfileField {
            field: self.name,
            offset: self.offset,
        }
    }

    fn span<'a>(&self, buf: &'a [u8]) -> Result<&'a [u8], Error> {
        buf.get(self.offset as usize..self.end() as usize)
            .ok_or_else(|| self.err())
    }

    /// Decode this field out of an in-memory structure.
    pub fn decode(&self, buf: &[u8]) -> Result<u64, Error> {
        Ok(decode_uint(self.span(buf)?, self.order))
    }

    /// Encode `v` into this field of an in-memory structure.
    ///
    /// Used to build profiles; values wider than the field are truncated.
    pub fn encode(&self, buf: &mut [u8], v: u64) -> Result<(), Error> {
        let end = self.end() as usize;
        let dst = buf
            .get_mut(self.offset as usize..end)
            .ok_or_else(|| self.err())?;
        let n = dst.len();
        for (i, b) in dst.iter_mut().enumerate() {
            let shift = match self.order {
                ByteOrder::Little => 8 * i,
                ByteOrder::Big => 8 * (n - 1 - i),
            };
            *b = (v >> shift) as u8;
        }
        Ok(())
    }
}

/// Total size of the profile structure. Files must be at least this long.
pub const PROFILE_SIZE: u32 = 0x3100;

/// Maximum number of coefficients per CFR pulse stored in the profile.
pub const PROFILE_MAX_PULSE_COEFFS: usize = 256;

/// Clock, channel and CPU assignment fields at the top of the profile.
#[allow(missing_docs)]
pub mod radio {
    use super::Field;

    pub const DEVICE_CLK_SCALED_KHZ: Field = Field::new("device_clk_scaled_khz", 0x000, 4);
    pub const PAD_DIV: Field = Field::new("pad_div", 0x004, 1);
    pub const ARM_CLK_DIV: Field = Field::new("arm_clk_div", 0x005, 1);
    pub const ARM_CLK_DIV_DEV_CLK: Field = Field::new("arm_clk_div_dev_clk", 0x006, 1);
    pub const CHAN_CONFIG: Field = Field::new("chan_config", 0x008, 4);
    pub const RX_TX_CPU_CONFIG: Field = Field::new("rx_tx_cpu_config", 0x00C, 1);
    pub const ORX_CPU_CONFIG: Field = Field::new("orx_cpu_config", 0x014, 1);
    pub const CHAN_ASSIGN: Field = Field::new("chan_assign", 0x016, 1);
    pub const HS_DIG_CLK_KHZ: Field = Field::new("hs_dig_clk_khz", 0x020, 4);
    pub const FEATURE_MASK: Field = Field::new("feature_mask", 0x024, 4);
}

/// JESD204 link settings.
#[allow(missing_docs)]
pub mod jesd {
    use super::Field;

    pub const RXDES_QHFRATE: Field = Field::new("jesd.rxdes_qhfrate", 0x034, 1);

    pub const FRAMER_BASE: u32 = 0x038;
    pub const DEFRAMER_BASE: u32 = 0x05C;
    pub const LINK_STRIDE: u32 = 12;
    pub const IQ_RATE_KHZ: Field = Field::new("jesd.link.iq_rate_khz", 0x0, 4);
    pub const LANE_RATE_KHZ: Field = Field::new("jesd.link.lane_rate_khz", 0x4, 4);
    pub const M: Field = Field::new("jesd.link.m", 0x8, 1);
    pub const NP: Field = Field::new("jesd.link.np", 0x9, 1);
    pub const LANES_ENABLED: Field = Field::new("jesd.link.lanes_enabled", 0xA, 1);

    pub const LINK_SHARING_BASE: u32 = 0x074;
    pub const LINK_SHARING_ENABLED: Field = Field::new("jesd.link_sharing.enabled", 0x0, 1);
    pub const LINK_SHARING_M: Field = Field::new("jesd.link_sharing.m", 0x1, 1);
    pub const LINK_SHARING_NP: Field = Field::new("jesd.link_sharing.np", 0x2, 1);
    pub const LINK_SHARING_XBAR: Field = Field::new("jesd.link_sharing.sample_xbar", 0x4, 1);

    pub const DES_LANE_CPU: Field = Field::new("jesd.des_lane_cpu", 0x08C, 1);
}

/// Per-band fields shared by the Rx DDC and Tx DUC structures.
#[allow(missing_docs)]
pub mod band {
    use super::Field;

    pub const STRIDE: u32 = 0x14;
    pub const ENABLE: Field = Field::new("band.enable", 0x00, 1);
    pub const CLK_DIV: Field = Field::new("band.clk_div", 0x01, 1);
    pub const TOTAL_DECIMATION: Field = Field::new("band.total_decimation", 0x04, 4);
    pub const INST_BW_KHZ: Field = Field::new("band.inst_bw_khz", 0x08, 4);
    pub const RF_CENTER_KHZ: Field = Field::new("band.rf_center_khz", 0x0C, 4);
    pub const NCO_FREQ_KHZ: Field = Field::new("band.nco_freq_khz", 0x10, 4);
}

/// Rx channel configuration slots.
#[allow(missing_docs)]
pub mod rx {
    use super::Field;

    pub const BASE: u32 = 0x100;
    pub const STRIDE: u32 = 0x40;
    pub const IBW_KHZ: Field = Field::new("rx.ibw_khz", 0x00, 4);
    pub const IBW_CENTER_KHZ: Field = Field::new("rx.ibw_center_khz", 0x04, 4);
    pub const OUTPUT_RATE_KHZ: Field = Field::new("rx.output_rate_khz", 0x08, 4);
    pub const ADC_CLK_KHZ: Field = Field::new("rx.adc_clk_khz", 0x0C, 4);
    pub const BANDS: u32 = 0x10;
}

/// Tx channel configuration slots.
#[allow(missing_docs)]
pub mod tx {
    use super::Field;

    pub const BASE: u32 = 0x200;
    pub const STRIDE: u32 = 0x40;
    pub const IBW_KHZ: Field = Field::new("tx.ibw_khz", 0x00, 4);
    pub const IBW_CENTER_KHZ: Field = Field::new("tx.ibw_center_khz", 0x04, 4);
    pub const LPBK_ADC_CLK_KHZ: Field = Field::new("tx.lpbk_adc_clk_khz", 0x08, 4);
    pub const PFIR_CLK_KHZ: Field = Field::new("tx.pfir_clk_khz", 0x0C, 4);
    pub const BANDS: u32 = 0x10;
}

/// ORx channel configurations.
#[allow(missing_docs)]
pub mod orx {
    use super::Field;

    pub const BASE: u32 = 0x300;
    pub const STRIDE: u32 = 0x10;
    pub const SBW_KHZ: Field = Field::new("orx.sbw_khz", 0x0, 4);
    pub const OUTPUT_RATE_KHZ: Field = Field::new("orx.output_rate_khz", 0x4, 4);
    pub const ADC_CLK_KHZ: Field = Field::new("orx.adc_clk_khz", 0x8, 4);
}

/// DFE-wide fields: JESD interleave modes and the radio-sequencer profile.
#[allow(missing_docs)]
pub mod dfe {
    use super::Field;

    pub const FRAMER_INTERLEAVE: Field = Field::new("dfe.framer_interleave", 0x400, 1);
    pub const DEFRAMER_INTERLEAVE: Field = Field::new("dfe.deframer_interleave", 0x403, 1);

    pub const RS_BASE: u32 = 0x408;
    pub const RS_RADIO_SEQ_EN: Field = Field::new("rs.radio_seq_en", 0x0, 1);
    pub const RS_SAMPLE_CLK_EN: Field = Field::new("rs.sample_clk_en", 0x1, 1);
    pub const RS_SAMPLE_CLK_DIV: Field = Field::new("rs.sample_clk_div", 0x2, 1);
    pub const RS_SSB_SYNC_MODE: Field = Field::new("rs.ssb_sync_mode", 0x3, 1);
    pub const RS_SSB_SYNC_PERIOD: Field = Field::new("rs.ssb_sync_period", 0x4, 4);
    pub const RS_SYMBOL_WIDTH: Field = Field::new("rs.symbol_width", 0x8, 2);
    pub const RS_EXT_SYMBOL_WIDTH: Field = Field::new("rs.ext_symbol_width", 0xA, 2);
    pub const RS_EXT_SYMBOL_SPACING: Field = Field::new("rs.ext_symbol_spacing", 0xC, 2);
}

/// Carrier up/down-converter structure, shared by Tx CDUC and Rx CDDC.
#[allow(missing_docs)]
pub mod carrier {
    use super::Field;

    pub const NUM_CARRIERS: u32 = 8;
    pub const ENABLED: Field = Field::new("carrier.enabled_mask", 0x00, 1);
    pub const BAND_RATIO: Field = Field::new("carrier.band_ratio", 0x01, 1);
    pub const MAX_SLOT: Field = Field::new("carrier.max_slot", 0x04, 4);
    pub const CARRIERS: u32 = 0x08;
    pub const STRIDE: u32 = 0x1C;
    pub const INPUT_RATE_KHZ: Field = Field::new("carrier.input_rate_khz", 0x00, 4);
    pub const IBW_KHZ: Field = Field::new("carrier.ibw_khz", 0x04, 4);
    pub const NCO_FREQ_KHZ: Field = Field::new("carrier.nco_freq_khz", 0x08, 4);
    pub const OUTPUT_RATE_KHZ: Field = Field::new("carrier.output_rate_khz", 0x0C, 4);
    pub const BAND_SELECT: Field = Field::new("carrier.band_select", 0x10, 1);
    pub const MIXER_ENABLE: Field = Field::new("carrier.mixer_enable", 0x11, 1);
    pub const DECIMATION: Field = Field::new("carrier.decimation_ratio", 0x12, 1);
    pub const INTERPOLATION: Field = Field::new("carrier.interpolation_ratio", 0x13, 1);
    pub const RATE_RATIO: Field = Field::new("carrier.rate_ratio", 0x14, 4);
}

/// Per-slot Tx DFE structures: carrier DUC, DPD and CFR.
#[allow(missing_docs)]
pub mod tx_dfe {
    use super::Field;

    pub const BASE: u32 = 0x500;
    pub const STRIDE: u32 = 0xA00;
    pub const CDUC: u32 = 0x000;
    pub const DPD_ACT_RATE_KHZ: Field = Field::new("tx_dfe.dpd_act_rate_khz", 0xF0, 4);
    pub const BAND_LATENCY: Field = Field::new("tx_dfe.band_latency", 0xF4, 2);
    pub const CFR0_INTERPOLATION: Field = Field::new("cfr.cfr0_interpolation", 0x100, 1);
    pub const CFR1_INTERPOLATION: Field = Field::new("cfr.cfr1_interpolation", 0x101, 1);
    pub const PULSE0: u32 = 0x104;
    pub const PULSE1: u32 = 0x508;
    pub const PULSE_NUM_COEFFS: Field = Field::new("cfr.pulse.num_coeffs", 0x0, 2);
    pub const PULSE_COEFF_RE: Field = Field::new("cfr.pulse.coeff_re", 0x4, 2);
    pub const PULSE_COEFF_IM: Field = Field::new("cfr.pulse.coeff_im", 0x6, 2);
    pub const PULSE_COEFF_STRIDE: u32 = 4;
}

/// Per-slot Rx DFE structures: carrier DDC.
#[allow(missing_docs)]
pub mod rx_dfe {
    use super::Field;

    pub const BASE: u32 = 0x2D00;
    pub const STRIDE: u32 = 0x100;
    pub const CDDC: u32 = 0x000;
    pub const BAND_LATENCY: Field = Field::new("rx_dfe.band_latency", 0xF0, 2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement() {
        let f = band::RF_CENTER_KHZ
            .nth(1, band::STRIDE)
            .at(rx::BANDS)
            .nth(2, rx::STRIDE)
            .at(rx::BASE);
        assert_eq!(f.offset, 0x100 + 2 * 0x40 + 0x10 + 0x14 + 0x0C);
        assert_eq!(f.name, "band.rf_center_khz");
    }

    #[test]
    fn encode_decode() {
        let mut buf = [0u8; 8];
        let f = Field::new("x", 2, 4);
        f.encode(&mut buf, 0x1122_3344).unwrap();
        assert_eq!(buf, [0, 0, 0x44, 0x33, 0x22, 0x11, 0, 0]);
        assert_eq!(f.decode(&buf).unwrap(), 0x1122_3344);
        let g = Field::new("y", 6, 4);
        assert!(matches!(
            g.decode(&buf),
            Err(Error::ProfileField { field: "y", offset: 6 })
        ));
    }

    #[test]
    fn structures_fit() {
        let last_tx = tx_dfe::PULSE_COEFF_IM
            .nth(PROFILE_MAX_PULSE_COEFFS as u32 - 1, tx_dfe::PULSE_COEFF_STRIDE)
            .at(tx_dfe::PULSE1)
            .at(tx_dfe::BASE + 3 * tx_dfe::STRIDE);
        assert!(last_tx.end() <= rx_dfe::BASE);
        let last_rx = rx_dfe::BAND_LATENCY
            .nth(1, 2)
            .at(rx_dfe::BASE + 3 * rx_dfe::STRIDE);
        assert!(last_rx.end() <= PROFILE_SIZE);
        let last_carrier = carrier::RATE_RATIO
            .nth(carrier::NUM_CARRIERS - 1, carrier::STRIDE)
            .at(carrier::CARRIERS);
        assert!(last_carrier.end() <= tx_dfe::DPD_ACT_RATE_KHZ.offset);
    }
}
