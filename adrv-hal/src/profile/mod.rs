/*!
Device-profile extraction.

A device profile is a fixed-layout binary file describing how the transceiver
is configured: clocks, which channels are in use, JESD204 links, per-channel
bandwidths and rates, carrier up/down-converters, and the radio-sequencer
profile. [`extract`] walks it with a [`ProfileReader`] and produces an
[`InitExtract`], the runtime configuration every later call works from.

Extraction either succeeds completely or returns the first bad field; a
partially filled [`InitExtract`] is never handed back.

```
use std::io::Cursor;
use adrv_hal::profile::{self, layout, ProfileReader};

# fn main() -> Result<(), adrv_hal::Error> {
let mut blob = vec![0u8; layout::PROFILE_SIZE as usize];
layout::radio::HS_DIG_CLK_KHZ.encode(&mut blob, 983_040)?;
// Every channel slot disabled.
for i in 0..8 {
    layout::radio::CHAN_ASSIGN.nth(i, 1).encode(&mut blob, 255)?;
}
let init = profile::extract(&mut ProfileReader::new(Cursor::new(blob))?)?;
assert_eq!(init.clocks.hs_dig_clk_khz, 983_040);
# Ok(())
# }
```
*/

pub mod layout;
mod reader;

use std::io::{Read, Seek};

use num_complex::Complex;
use tracing::debug;

use crate::consts::{CHAN_DISABLED, JESD_IQ_RATE_KHZ, NUM_ORX_CHANNELS, NUM_PROFILE_CHANNELS};
use crate::Error;
use layout::{band, carrier, jesd, orx, radio, rx, rx_dfe, tx, tx_dfe, Field};

pub use reader::ProfileReader;

/// Mask of all Tx channel bits in the channel config word.
pub const TX_ALL: u32 = 0xFF;
/// Mask of all Rx channel bits, after shifting the channel config word down
/// by 8.
pub const RX_ALL: u32 = 0xFF;
/// Mask of both ORx channel bits, after shifting the channel config word down
/// by 8.
pub const ORX_ALL: u32 = 0x300;

/// Device clock settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ClockSettings {
    pub device_clock_scaled_khz: u32,
    pub pad_div: u8,
    pub arm_clk_div: u8,
    pub arm_clk_div_dev_clk: u8,
    pub hs_dig_clk_khz: u32,
}

/// One JESD204 framer or deframer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct JesdLink {
    pub iq_rate_khz: u32,
    pub lane_rate_khz: u32,
    pub m: u8,
    pub np: u8,
    /// Bitmask of serializer or deserializer lanes in use.
    pub lanes_enabled: u8,
}

/// Link-sharing settings of one framer. `m` and `np` are zero when sharing is
/// disabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct LinkSharing {
    pub m: u8,
    pub np: u8,
    pub sample_xbar: [u8; 8],
}

/// JESD204 link settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct JesdSettings {
    pub rxdes_qhfrate: u8,
    pub framers: [JesdLink; 3],
    pub deframers: [JesdLink; 2],
    pub link_sharing: [LinkSharing; 2],
    /// CPU owning each deserializer lane.
    pub des_lane_cpu: [u8; 8],
    pub framer_interleave: [u8; 3],
    pub deframer_interleave: [u8; 2],
}

/// One DDC/DUC band.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct BandSettings {
    pub enabled: bool,
    pub inst_bw_khz: u32,
    pub rf_center_khz: u32,
    pub sample_rate_khz: u32,
    /// NCO offset of the band relative to the channel's IBW center.
    pub band_offset_khz: i64,
}

/// Derived Rx channel configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct RxChannelConfig {
    pub rf_bandwidth_khz: u32,
    /// Output rate of each DDC band after the band split.
    pub ddc_output_rate_khz: [u32; 2],
    /// Bit `n` set if band `n` is enabled.
    pub dig_chan_mask: u8,
    pub adc_sample_rate_khz: u32,
    pub bands: [BandSettings; 2],
}

/// Derived Tx channel configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TxChannelConfig {
    pub rf_bandwidth_khz: u32,
    pub total_decimation: u32,
    pub dig_chan_mask: u8,
    pub lpbk_adc_sample_rate_khz: u32,
    pub pfir_rate_khz: u32,
    pub bands: [BandSettings; 2],
}

/// ORx channel configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct OrxChannelConfig {
    pub sbw_khz: u32,
    pub output_rate_khz: u32,
    pub adc_sample_rate_khz: u32,
}

/// Radio-sequencer profile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct RadioSeqProfile {
    pub radio_seq_en: bool,
    pub sample_clk_en: bool,
    pub sample_clk_div: u8,
    pub ssb_sync_mode: u8,
    pub ssb_sync_period: u32,
    pub symbol_width: u16,
    pub ext_symbol_width: u16,
    pub ext_symbol_spacing: u16,
}

/// One carrier of a carrier DUC/DDC. Disabled carriers are all zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Carrier {
    pub enabled: bool,
    pub sample_rate_khz: u32,
    /// Absolute center: the selected band's RF center plus the carrier NCO.
    pub center_khz: i64,
    pub ibw_khz: u32,
    pub band_select: u8,
    pub mixer_enable: u8,
    pub decimation_ratio: u8,
    pub interpolation_ratio: u8,
    pub nco_freq_khz: i32,
    pub rate_ratio: u32,
    pub output_rate_khz: u32,
}

/// Carrier DUC (Tx) or DDC (Rx) configuration of one channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CarrierConfig {
    pub output_rate_khz: u32,
    pub band_ratio: [u8; 2],
    /// Scheduling slot count, corrected for the slowest carrier on Tx.
    pub max_slot: u32,
    pub carriers: [Carrier; 8],
    pub band_latency: [u16; 2],
}

/// Runtime configuration derived from a device profile.
///
/// Per-channel arrays are indexed by physical channel. Channels whose slot
/// assignment is disabled are left all-zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct InitExtract {
    pub clocks: ClockSettings,
    /// Tx channels present in the profile.
    pub tx_channel_mask: u32,
    /// Rx channels in bits 0..8, ORx channels in bits 8..10.
    pub rx_channel_mask: u32,
    pub rx_tx_cpu_config: [u8; 8],
    pub orx_cpu_config: [u8; 2],
    /// Profile slot (0..=3) of each physical channel, or 255 if disabled.
    pub chan_assign: [u8; 8],
    pub feature_mask: [u32; 4],
    pub jesd: JesdSettings,
    pub rx: [RxChannelConfig; 8],
    pub tx: [TxChannelConfig; 8],
    pub orx: [OrxChannelConfig; NUM_ORX_CHANNELS],
    pub rs: RadioSeqProfile,
    pub tx_carriers: [CarrierConfig; 8],
    pub rx_carriers: [CarrierConfig; 8],
    pub dpd_output_rate_khz: [u32; 8],
}

/// CFR correction pulses stored in the profile for one Tx channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CfrProfilePulses {
    /// Interpolation of CFR engine 0 and 1.
    pub interpolation: [u8; 2],
    /// Pulse 0 and pulse 1. Pulses with no coefficients are empty.
    pub pulses: [Vec<Complex<i16>>; 2],
}

fn bad(field: Field) -> Error {
    Error::ProfileField {
        field: field.name,
        offset: field.offset,
    }
}

/// Profile slot of physical channel `ch`, `None` if it's disabled.
fn slot(assign: u8, field: Field) -> Result<Option<u32>, Error> {
    match assign {
        CHAN_DISABLED => Ok(None),
        0..=3 => Ok(Some(assign as u32)),
        _ => Err(bad(field)),
    }
}

/// Extract the runtime configuration from a profile.
///
/// # Errors
///
/// Returns [`Error::ProfileField`] for the first field that can't be read or
/// holds an impossible value. Nothing is returned in that case.
pub fn extract<R: Read + Seek>(r: &mut ProfileReader<R>) -> Result<InitExtract, Error> {
    let mut x = InitExtract::default();

    x.clocks = ClockSettings {
        device_clock_scaled_khz: r.u32(radio::DEVICE_CLK_SCALED_KHZ)?,
        pad_div: r.u8(radio::PAD_DIV)?,
        arm_clk_div: r.u8(radio::ARM_CLK_DIV)?,
        arm_clk_div_dev_clk: r.u8(radio::ARM_CLK_DIV_DEV_CLK)?,
        hs_dig_clk_khz: r.u32(radio::HS_DIG_CLK_KHZ)?,
    };

    let chan_config = r.u32(radio::CHAN_CONFIG)?;
    x.tx_channel_mask = chan_config & TX_ALL;
    x.rx_channel_mask = (chan_config >> 8) & (RX_ALL | ORX_ALL);
    x.rx_tx_cpu_config = r.u8_array(radio::RX_TX_CPU_CONFIG)?;
    x.orx_cpu_config = r.u8_array(radio::ORX_CPU_CONFIG)?;
    x.chan_assign = r.u8_array(radio::CHAN_ASSIGN)?;
    for (i, m) in x.feature_mask.iter_mut().enumerate() {
        *m = r.u32(radio::FEATURE_MASK.nth(i as u32, 4))?;
    }

    x.jesd = extract_jesd(r)?;

    for ch in 0..NUM_PROFILE_CHANNELS {
        let assign_field = radio::CHAN_ASSIGN.nth(ch as u32, 1);
        if let Some(s) = slot(x.chan_assign[ch], assign_field)? {
            x.rx[ch] = extract_rx(r, s, x.clocks.hs_dig_clk_khz)?;
            x.tx[ch] = extract_tx(r, s, x.clocks.hs_dig_clk_khz)?;
        }
    }

    for (i, o) in x.orx.iter_mut().enumerate() {
        let base = orx::BASE + i as u32 * orx::STRIDE;
        *o = OrxChannelConfig {
            sbw_khz: r.u32(orx::SBW_KHZ.at(base))?,
            output_rate_khz: r.u32(orx::OUTPUT_RATE_KHZ.at(base))?,
            adc_sample_rate_khz: r.u32(orx::ADC_CLK_KHZ.at(base))?,
        };
    }

    let rs = layout::dfe::RS_BASE;
    x.rs = RadioSeqProfile {
        radio_seq_en: r.u8(layout::dfe::RS_RADIO_SEQ_EN.at(rs))? != 0,
        sample_clk_en: r.u8(layout::dfe::RS_SAMPLE_CLK_EN.at(rs))? != 0,
        sample_clk_div: r.u8(layout::dfe::RS_SAMPLE_CLK_DIV.at(rs))?,
        ssb_sync_mode: r.u8(layout::dfe::RS_SSB_SYNC_MODE.at(rs))?,
        ssb_sync_period: r.u32(layout::dfe::RS_SSB_SYNC_PERIOD.at(rs))?,
        symbol_width: r.u16(layout::dfe::RS_SYMBOL_WIDTH.at(rs))?,
        ext_symbol_width: r.u16(layout::dfe::RS_EXT_SYMBOL_WIDTH.at(rs))?,
        ext_symbol_spacing: r.u16(layout::dfe::RS_EXT_SYMBOL_SPACING.at(rs))?,
    };

    for ch in 0..NUM_PROFILE_CHANNELS {
        let Some(s) = slot(x.chan_assign[ch], radio::CHAN_ASSIGN.nth(ch as u32, 1))? else {
            continue;
        };
        let tx_base = tx_dfe::BASE + s * tx_dfe::STRIDE;
        let mut duc = extract_carriers(r, tx_base + tx_dfe::CDUC, &x.tx[ch].bands)?;
        correct_max_slot(&mut duc);
        for (i, l) in duc.band_latency.iter_mut().enumerate() {
            *l = r.u16(tx_dfe::BAND_LATENCY.nth(i as u32, 2).at(tx_base))?;
        }
        x.tx_carriers[ch] = duc;
        x.dpd_output_rate_khz[ch] = r.u32(tx_dfe::DPD_ACT_RATE_KHZ.at(tx_base))?;

        let rx_base = rx_dfe::BASE + s * rx_dfe::STRIDE;
        let mut ddc = extract_carriers(r, rx_base + rx_dfe::CDDC, &x.rx[ch].bands)?;
        for (i, l) in ddc.band_latency.iter_mut().enumerate() {
            *l = r.u16(rx_dfe::BAND_LATENCY.nth(i as u32, 2).at(rx_base))?;
        }
        x.rx_carriers[ch] = ddc;
    }

    debug!(
        "profile extracted: tx mask 0x{:02x}, rx mask 0x{:03x}, chan_assign {:?}",
        x.tx_channel_mask, x.rx_channel_mask, x.chan_assign
    );
    Ok(x)
}

fn extract_jesd<R: Read + Seek>(r: &mut ProfileReader<R>) -> Result<JesdSettings, Error> {
    let mut j = JesdSettings {
        rxdes_qhfrate: r.u8(jesd::RXDES_QHFRATE)?,
        ..Default::default()
    };
    let link = |r: &mut ProfileReader<R>, base: u32| -> Result<JesdLink, Error> {
        Ok(JesdLink {
            iq_rate_khz: r.u32(jesd::IQ_RATE_KHZ.at(base))?,
            lane_rate_khz: r.u32(jesd::LANE_RATE_KHZ.at(base))?,
            m: r.u8(jesd::M.at(base))?,
            np: r.u8(jesd::NP.at(base))?,
            lanes_enabled: r.u8(jesd::LANES_ENABLED.at(base))?,
        })
    };
    for (i, f) in j.framers.iter_mut().enumerate() {
        *f = link(r, jesd::FRAMER_BASE + i as u32 * jesd::LINK_STRIDE)?;
    }
    for (i, d) in j.deframers.iter_mut().enumerate() {
        *d = link(r, jesd::DEFRAMER_BASE + i as u32 * jesd::LINK_STRIDE)?;
    }
    for (i, ls) in j.link_sharing.iter_mut().enumerate() {
        let base = jesd::LINK_SHARING_BASE + i as u32 * jesd::LINK_STRIDE;
        if r.u8(jesd::LINK_SHARING_ENABLED.at(base))? != 0 {
            ls.m = r.u8(jesd::LINK_SHARING_M.at(base))?;
            ls.np = r.u8(jesd::LINK_SHARING_NP.at(base))?;
        }
        ls.sample_xbar = r.u8_array(jesd::LINK_SHARING_XBAR.at(base))?;
    }
    j.des_lane_cpu = r.u8_array(jesd::DES_LANE_CPU)?;
    j.framer_interleave = r.u8_array(layout::dfe::FRAMER_INTERLEAVE)?;
    j.deframer_interleave = r.u8_array(layout::dfe::DEFRAMER_INTERLEAVE)?;
    Ok(j)
}

/// Split a channel's output rate between its two DDC bands.
///
/// With only band 0 in use it gets the whole rate. With both, the band with
/// the lower total decimation keeps the full rate and the other is scaled by
/// the decimation ratio.
pub fn split_band_rates(
    output_rate_khz: u32,
    band1_enabled: bool,
    dec0: u32,
    dec1: u32,
) -> Option<[u32; 2]> {
    if !band1_enabled {
        return Some([output_rate_khz, 0]);
    }
    if dec0 == 0 || dec1 == 0 {
        return None;
    }
    let scale = |num: u32, den: u32| (output_rate_khz as u64 * num as u64 / den as u64) as u32;
    if dec1 > dec0 {
        Some([output_rate_khz, scale(dec0, dec1)])
    } else {
        Some([scale(dec1, dec0), output_rate_khz])
    }
}

fn extract_bands<R: Read + Seek>(
    r: &mut ProfileReader<R>,
    bands_base: u32,
    ibw_center_khz: u32,
    hs_dig_clk_khz: u32,
) -> Result<[BandSettings; 2], Error> {
    let mut out = [BandSettings::default(); 2];
    for (b, o) in out.iter_mut().enumerate() {
        let base = bands_base + b as u32 * band::STRIDE;
        if r.u8(band::ENABLE.at(base))? != 1 {
            continue;
        }
        let div_field = band::CLK_DIV.at(base);
        let div = r.u8(div_field)?;
        if div >= 32 {
            return Err(bad(div_field));
        }
        let rf_center_khz = r.u32(band::RF_CENTER_KHZ.at(base))?;
        let nco = r.u32(band::NCO_FREQ_KHZ.at(base))?;
        *o = BandSettings {
            enabled: true,
            inst_bw_khz: r.u32(band::INST_BW_KHZ.at(base))?,
            rf_center_khz,
            sample_rate_khz: hs_dig_clk_khz >> div,
            band_offset_khz: nco as i64 - (ibw_center_khz as i64 - rf_center_khz as i64),
        };
    }
    Ok(out)
}

fn extract_rx<R: Read + Seek>(
    r: &mut ProfileReader<R>,
    slot: u32,
    hs_dig_clk_khz: u32,
) -> Result<RxChannelConfig, Error> {
    let base = rx::BASE + slot * rx::STRIDE;
    let bands_base = base + rx::BANDS;
    let output_rate = r.u32(rx::OUTPUT_RATE_KHZ.at(base))?;
    let en0 = r.u8(band::ENABLE.at(bands_base))? == 1;
    let en1 = r.u8(band::ENABLE.nth(1, band::STRIDE).at(bands_base))? == 1;
    let dec0_field = band::TOTAL_DECIMATION.at(bands_base);
    let dec0 = r.u32(dec0_field)?;
    let dec1 = r.u32(band::TOTAL_DECIMATION.nth(1, band::STRIDE).at(bands_base))?;
    let ddc_output_rate_khz =
        split_band_rates(output_rate, en1, dec0, dec1).ok_or_else(|| bad(dec0_field))?;
    let ibw_center = r.u32(rx::IBW_CENTER_KHZ.at(base))?;
    Ok(RxChannelConfig {
        rf_bandwidth_khz: r.u32(rx::IBW_KHZ.at(base))?,
        ddc_output_rate_khz,
        dig_chan_mask: ((en1 as u8) << 1) | en0 as u8,
        adc_sample_rate_khz: r.u32(rx::ADC_CLK_KHZ.at(base))?,
        bands: extract_bands(r, bands_base, ibw_center, hs_dig_clk_khz)?,
    })
}

fn extract_tx<R: Read + Seek>(
    r: &mut ProfileReader<R>,
    slot: u32,
    hs_dig_clk_khz: u32,
) -> Result<TxChannelConfig, Error> {
    let base = tx::BASE + slot * tx::STRIDE;
    let bands_base = base + tx::BANDS;
    let dec_field = band::TOTAL_DECIMATION.at(bands_base);
    let total_decimation = r.u32(dec_field)?;
    if total_decimation > 8 {
        return Err(bad(dec_field));
    }
    let ibw_center = r.u32(tx::IBW_CENTER_KHZ.at(base))?;
    Ok(TxChannelConfig {
        rf_bandwidth_khz: r.u32(tx::IBW_KHZ.at(base))?,
        total_decimation,
        dig_chan_mask: r.u8(band::ENABLE.at(bands_base))?,
        lpbk_adc_sample_rate_khz: r.u32(tx::LPBK_ADC_CLK_KHZ.at(base))?,
        pfir_rate_khz: r.u32(tx::PFIR_CLK_KHZ.at(base))?,
        bands: extract_bands(r, bands_base, ibw_center, hs_dig_clk_khz)?,
    })
}

fn extract_carriers<R: Read + Seek>(
    r: &mut ProfileReader<R>,
    base: u32,
    bands: &[BandSettings; 2],
) -> Result<CarrierConfig, Error> {
    let enabled = r.u8(carrier::ENABLED.at(base))?;
    let carriers_base = base + carrier::CARRIERS;
    let mut c = CarrierConfig {
        output_rate_khz: r.u32(carrier::INPUT_RATE_KHZ.at(carriers_base))?,
        band_ratio: r.u8_array(carrier::BAND_RATIO.at(base))?,
        max_slot: r.u32(carrier::MAX_SLOT.at(base))?,
        ..Default::default()
    };
    for (i, out) in c.carriers.iter_mut().enumerate() {
        if enabled & (1 << i) == 0 {
            continue;
        }
        let cb = carriers_base + i as u32 * carrier::STRIDE;
        let sel_field = carrier::BAND_SELECT.at(cb);
        let band_select = r.u8(sel_field)?;
        let band = bands.get(band_select as usize).ok_or_else(|| bad(sel_field))?;
        let nco_freq_khz = r.i32(carrier::NCO_FREQ_KHZ.at(cb))?;
        *out = Carrier {
            enabled: true,
            sample_rate_khz: r.u32(carrier::INPUT_RATE_KHZ.at(cb))?,
            center_khz: band.rf_center_khz as i64 + nco_freq_khz as i64,
            ibw_khz: r.u32(carrier::IBW_KHZ.at(cb))?,
            band_select,
            mixer_enable: r.u8(carrier::MIXER_ENABLE.at(cb))?,
            decimation_ratio: r.u8(carrier::DECIMATION.at(cb))?,
            interpolation_ratio: r.u8(carrier::INTERPOLATION.at(cb))?,
            nco_freq_khz,
            rate_ratio: r.u32(carrier::RATE_RATIO.at(cb))?,
            output_rate_khz: r.u32(carrier::OUTPUT_RATE_KHZ.at(cb))?,
        };
    }
    Ok(c)
}

/// Scale the max slot down when the slowest carrier runs below the JESD IQ
/// rate.
fn correct_max_slot(c: &mut CarrierConfig) {
    let min = c
        .carriers
        .iter()
        .filter(|c| c.enabled && c.sample_rate_khz > 0)
        .map(|c| c.sample_rate_khz)
        .min();
    if let Some(min) = min {
        if min < JESD_IQ_RATE_KHZ {
            c.max_slot /= JESD_IQ_RATE_KHZ / min;
        }
    }
}

/// Read the CFR pulses for every Tx channel set in `tx_mask`.
///
/// The result is indexed by physical channel; channels not in the mask, or
/// with a disabled slot, are `None`.
///
/// # Errors
///
/// [`Error::ProfileField`] if a pulse is unreadable, longer than
/// [`layout::PROFILE_MAX_PULSE_COEFFS`], or if a masked channel has an
/// invalid slot assignment.
pub fn extract_cfr_pulses<R: Read + Seek>(
    r: &mut ProfileReader<R>,
    tx_mask: u32,
) -> Result<Vec<Option<CfrProfilePulses>>, Error> {
    let mut out = vec![None; NUM_PROFILE_CHANNELS];
    for (ch, o) in out.iter_mut().enumerate() {
        if tx_mask & (1 << ch) == 0 {
            continue;
        }
        let assign_field = radio::CHAN_ASSIGN.nth(ch as u32, 1);
        let Some(s) = slot(r.u8(assign_field)?, assign_field)? else {
            continue;
        };
        let base = tx_dfe::BASE + s * tx_dfe::STRIDE;
        let mut p = CfrProfilePulses {
            interpolation: [
                r.u8(tx_dfe::CFR0_INTERPOLATION.at(base))?,
                r.u8(tx_dfe::CFR1_INTERPOLATION.at(base))?,
            ],
            ..Default::default()
        };
        for (k, pulse_base) in [tx_dfe::PULSE0, tx_dfe::PULSE1].into_iter().enumerate() {
            let pb = base + pulse_base;
            let n_field = tx_dfe::PULSE_NUM_COEFFS.at(pb);
            let n = r.u16(n_field)? as usize;
            if n > layout::PROFILE_MAX_PULSE_COEFFS {
                return Err(bad(n_field));
            }
            p.pulses[k] = (0..n as u32)
                .map(|i| {
                    Ok(Complex::new(
                        r.i16(tx_dfe::PULSE_COEFF_RE.nth(i, tx_dfe::PULSE_COEFF_STRIDE).at(pb))?,
                        r.i16(tx_dfe::PULSE_COEFF_IM.nth(i, tx_dfe::PULSE_COEFF_STRIDE).at(pb))?,
                    ))
                })
                .collect::<Result<Vec<_>, Error>>()?;
        }
        *o = Some(p);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn band_split() {
        assert_eq!(split_band_rates(100, true, 2, 4), Some([100, 50]));
        assert_eq!(split_band_rates(100, true, 4, 2), Some([50, 100]));
        assert_eq!(split_band_rates(100, true, 4, 4), Some([100, 100]));
        assert_eq!(split_band_rates(100, false, 2, 4), Some([100, 0]));
        assert_eq!(split_band_rates(100, true, 0, 4), None);
    }

    #[test]
    fn max_slot_correction() {
        let mut c = CarrierConfig {
            max_slot: 64,
            ..Default::default()
        };
        c.carriers[0].enabled = true;
        c.carriers[0].sample_rate_khz = JESD_IQ_RATE_KHZ / 4;
        c.carriers[3].enabled = true;
        c.carriers[3].sample_rate_khz = JESD_IQ_RATE_KHZ / 2;
        correct_max_slot(&mut c);
        assert_eq!(c.max_slot, 16);

        let mut c = CarrierConfig {
            max_slot: 64,
            ..Default::default()
        };
        correct_max_slot(&mut c);
        assert_eq!(c.max_slot, 64);
    }

    #[test]
    fn bad_chan_assign() {
        let mut blob = vec![0u8; layout::PROFILE_SIZE as usize];
        for i in 0..8 {
            radio::CHAN_ASSIGN.nth(i, 1).encode(&mut blob, 255).unwrap();
        }
        radio::CHAN_ASSIGN.nth(5, 1).encode(&mut blob, 7).unwrap();
        let mut r = ProfileReader::new(Cursor::new(blob)).unwrap();
        match extract(&mut r) {
            Err(Error::ProfileField { field, offset }) => {
                assert_eq!(field, "chan_assign");
                assert_eq!(offset, radio::CHAN_ASSIGN.offset + 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disabled_channels_are_zero() {
        let mut blob = vec![0xAAu8; layout::PROFILE_SIZE as usize];
        for i in 0..8 {
            radio::CHAN_ASSIGN.nth(i, 1).encode(&mut blob, 255).unwrap();
        }
        let mut r = ProfileReader::new(Cursor::new(blob)).unwrap();
        let x = extract(&mut r).unwrap();
        assert_eq!(x.rx[0], RxChannelConfig::default());
        assert_eq!(x.tx_carriers[7], CarrierConfig::default());
        assert_eq!(x.clocks.pad_div, 0xAA);
    }
}
