//! Closed-loop gain control (CLGC).
//!
//! CLGC measures the Tx to ORx loop gain and trims the Tx attenuation to
//! hold it at the expected value. Its configuration lives in a co-processor
//! config object with one block per Tx channel.

use tracing::debug;

use super::{check_tx, field, field_f32, put, TxChannels};
use crate::consts::*;
use crate::hal::Hal;
use crate::mailbox::Mailbox;
use crate::profile::layout::Field;
use crate::Error;

/// Largest allowed loop-gain adjustment step, in dB.
pub const CLGC_MAX_GAIN_STEP_DB: f32 = 6.0;

/// CLGC configuration for one Tx channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClgcConfig {
    /// Track *and* control the loop gain. When off, CLGC only measures.
    pub enable: bool,
    /// Sampling period, in microseconds.
    pub batch_time_us: u16,
    /// Expected loop gain (ORx power over Tx power), in dB.
    pub expected_loop_gain_db: f32,
    /// Minimum Tx level needed to run, in dBFS.
    pub tx_qual_threshold_dbfs: f32,
    /// Minimum ORx level needed to run, in dBFS.
    pub orx_qual_threshold_dbfs: f32,
    /// Largest attenuation step per update, in dB. Must be in `(0, 6]`.
    pub max_gain_step_db: f32,
    /// Lowest Tx attenuation CLGC may select, in dB.
    pub min_tx_atten_db: f32,
    /// Highest Tx attenuation CLGC may select, in dB.
    pub max_tx_atten_db: f32,
}

impl Default for ClgcConfig {
    fn default() -> Self {
        Self {
            enable: false,
            batch_time_us: 400,
            expected_loop_gain_db: 0.0,
            tx_qual_threshold_dbfs: -40.0,
            orx_qual_threshold_dbfs: -40.0,
            max_gain_step_db: 1.0,
            min_tx_atten_db: 0.0,
            max_tx_atten_db: 20.0,
        }
    }
}

mod config {
    use crate::profile::layout::Field;

    pub const BATCH_TIME: Field = Field::new("batch_time_us", 0, 2);
    pub const FRAC_DELAY: Field = Field::new("frac_delay", 2, 2);
    pub const ENABLE: Field = Field::new("enable", 4, 1);
    pub const DPD_SYNC: Field = Field::new("dpd_sync", 6, 1);
    pub const PA_PROTECT: Field = Field::new("pa_protect", 7, 1);
    pub const MAX_BATCHES: Field = Field::new("max_batches", 8, 4);
    pub const ORX_NOISE_DENSITY: Field = Field::new("orx_noise_density", 12, 4);
    pub const TX_QUAL_THRESHOLD: Field = Field::new("tx_qual_threshold", 16, 4);
    pub const ORX_QUAL_THRESHOLD: Field = Field::new("orx_qual_threshold", 20, 4);
    pub const RIPPLE: Field = Field::new("expected_loop_gain_ripple", 24, 4);
    pub const EXPECTED_LOOP_GAIN: Field = Field::new("expected_loop_gain", 28, 4);
    pub const MAX_GAIN_STEP: Field = Field::new("max_gain_step", 32, 4);
    pub const MIN_TX_ATTEN: Field = Field::new("min_tx_atten", 36, 4);
    pub const MAX_TX_ATTEN: Field = Field::new("max_tx_atten", 40, 4);
    pub const DAMPING: Field = Field::new("damping", 44, 4);
    pub const ORX_NOISE_TRACK: Field = Field::new("orx_noise_track", 48, 4);
}

mod status {
    use crate::profile::layout::Field;

    pub const ERROR_CODE: Field = Field::new("error_code", 0, 4);
    pub const PERCENT_COMPLETE: Field = Field::new("percent_complete", 4, 4);
    pub const VARIANCE: Field = Field::new("variance", 8, 4);
    pub const ITER_COUNT: Field = Field::new("iter_count", 12, 4);
    pub const UPDATE_COUNT: Field = Field::new("update_count", 16, 4);
    pub const STATE: Field = Field::new("state", 20, 1);
    pub const CAPTURE_STATUS: Field = Field::new("capture_status", 24, 1);
    pub const SYNC_STATUS: Field = Field::new("sync_status", 28, 4);
    pub const TX_ATTEN: Field = Field::new("tx_atten", 42, 2);
    pub const ORX_GAIN_INDEX: Field = Field::new("orx_gain_index", 44, 1);
    pub const TX_RMS: Field = Field::new("tx_rms", 88, 4);
    pub const ORX_RMS: Field = Field::new("orx_rms", 92, 4);
    pub const LOOP_GAIN: Field = Field::new("loop_gain", 96, 4);
}

/// Where the CLGC algorithm is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ClgcRunState {
    /// Initializing. Stays here if gain control is disabled.
    Initial,
    Normal,
    TxAttenAtLowLimit,
    TxAttenAtHighLimit,
    UserChangedLoopGain,
    UserChangedTxAtten,
    BatchLimitReached,
    PaProtectionAsserted,
}

impl ClgcRunState {
    fn from_raw(v: u8) -> Option<Self> {
        use ClgcRunState::*;
        Some(match v {
            0 => Initial,
            1 => Normal,
            2 => TxAttenAtLowLimit,
            3 => TxAttenAtHighLimit,
            4 => UserChangedLoopGain,
            5 => UserChangedTxAtten,
            6 => BatchLimitReached,
            7 => PaProtectionAsserted,
            _ => return None,
        })
    }
}

/// CLGC status for one Tx channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClgcStatus {
    /// Firmware error code, 0 if none.
    pub error_code: u32,
    /// Progress of the current iteration.
    pub percent_complete: u32,
    /// Variance of the loop-gain measurement.
    pub variance: u32,
    /// Iterations run.
    pub iter_count: u32,
    /// Updates applied.
    pub update_count: u32,
    /// Algorithm state.
    pub state: ClgcRunState,
    /// Raw status of the last Tx/ORx capture. 0 is success.
    pub capture_status: u8,
    /// Synchronization status with DPD.
    pub sync_status: u32,
    /// Active Tx attenuation table index.
    pub tx_atten_index: u16,
    /// Active ORx gain index.
    pub orx_gain_index: u8,
    /// Tx RMS power from the last measurement.
    pub tx_rms_power: f32,
    /// ORx RMS power from the last measurement.
    pub orx_rms_power: f32,
    /// Linear loop gain, ORx RMS over Tx RMS.
    pub loop_gain: f32,
}

/// CLGC operations. Get one with [`Device::clgc`][crate::Device::clgc].
pub struct Clgc<'a, H: Hal + ?Sized> {
    mb: Mailbox<'a, H>,
}

impl<'a, H: Hal + ?Sized> Clgc<'a, H> {
    /// CLGC operations on a bare HAL.
    pub fn new(hal: &'a mut H) -> Self {
        Self {
            mb: Mailbox::new(hal),
        }
    }

    /// Write `cfg` to every channel in `mask`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] if the gain step is outside `(0, 6]` dB
    /// or the attenuation limits are inverted. Nothing is written then.
    pub fn set_config(&mut self, mask: TxChannels, cfg: &ClgcConfig) -> Result<(), Error> {
        if !(cfg.max_gain_step_db > 0.0 && cfg.max_gain_step_db <= CLGC_MAX_GAIN_STEP_DB) {
            return Err(Error::InvalidParameter("CLGC gain step must be in (0, 6] dB"));
        }
        if cfg.min_tx_atten_db > cfg.max_tx_atten_db {
            return Err(Error::InvalidParameter(
                "CLGC min Tx attenuation above max",
            ));
        }
        let block = encode_config(cfg)?;
        for tx in mask.non_empty()?.indices() {
            debug!("CLGC config to Tx{tx}, enable {}", cfg.enable);
            self.mb.config_write(
                OBJID_CLGC_TRACKING,
                tx as u16 * CLGC_CONFIG_STRIDE,
                &block,
            )?;
        }
        Ok(())
    }

    /// Read back the configuration of Tx channel `tx`.
    pub fn config(&mut self, tx: usize) -> Result<ClgcConfig, Error> {
        check_tx(tx)?;
        let b = self.mb.config_read(
            OBJID_CLGC_TRACKING,
            tx as u16 * CLGC_CONFIG_STRIDE,
            CLGC_CONFIG_SIZE as u8,
        )?;
        use config::*;
        Ok(ClgcConfig {
            enable: field(&b, ENABLE)? != 0,
            batch_time_us: field(&b, BATCH_TIME)? as u16,
            expected_loop_gain_db: field_f32(&b, EXPECTED_LOOP_GAIN)?,
            tx_qual_threshold_dbfs: field_f32(&b, TX_QUAL_THRESHOLD)?,
            orx_qual_threshold_dbfs: field_f32(&b, ORX_QUAL_THRESHOLD)?,
            max_gain_step_db: field_f32(&b, MAX_GAIN_STEP)?,
            min_tx_atten_db: field_f32(&b, MIN_TX_ATTEN)?,
            max_tx_atten_db: field_f32(&b, MAX_TX_ATTEN)?,
        })
    }

    /// Read the status of Tx channel `tx`.
    pub fn status(&mut self, tx: usize) -> Result<ClgcStatus, Error> {
        check_tx(tx)?;
        let b = self
            .mb
            .status_get(OBJID_CLGC_TRACKING, tx as u8, CLGC_STATUS_SIZE)?;
        use status::*;
        let u32_at = |f: Field| field(&b, f).map(|v| v as u32);
        let state = ClgcRunState::from_raw(field(&b, STATE)? as u8).ok_or(Error::ReturnData)?;
        Ok(ClgcStatus {
            error_code: u32_at(ERROR_CODE)?,
            percent_complete: u32_at(PERCENT_COMPLETE)?,
            variance: u32_at(VARIANCE)?,
            iter_count: u32_at(ITER_COUNT)?,
            update_count: u32_at(UPDATE_COUNT)?,
            state,
            capture_status: field(&b, CAPTURE_STATUS)? as u8,
            sync_status: u32_at(SYNC_STATUS)?,
            tx_atten_index: ((field(&b, TX_ATTEN)? >> 4) & 0xFFF) as u16,
            orx_gain_index: field(&b, ORX_GAIN_INDEX)? as u8,
            tx_rms_power: field_f32(&b, TX_RMS)?,
            orx_rms_power: field_f32(&b, ORX_RMS)?,
            loop_gain: field_f32(&b, LOOP_GAIN)?,
        })
    }
}

fn encode_config(cfg: &ClgcConfig) -> Result<Vec<u8>, Error> {
    use config::*;
    let mut b = vec![0u8; CLGC_CONFIG_SIZE];
    let f = |v: f32| v.to_bits() as u64;
    put(&mut b, BATCH_TIME, cfg.batch_time_us as u64)?;
    put(&mut b, FRAC_DELAY, 0)?;
    put(&mut b, ENABLE, cfg.enable as u64)?;
    put(&mut b, DPD_SYNC, 1)?;
    put(&mut b, PA_PROTECT, 1)?;
    put(&mut b, MAX_BATCHES, 514)?;
    put(&mut b, ORX_NOISE_DENSITY, f(-153.0))?;
    put(&mut b, TX_QUAL_THRESHOLD, f(cfg.tx_qual_threshold_dbfs))?;
    put(&mut b, ORX_QUAL_THRESHOLD, f(cfg.orx_qual_threshold_dbfs))?;
    put(&mut b, RIPPLE, f(0.05))?;
    put(&mut b, EXPECTED_LOOP_GAIN, f(cfg.expected_loop_gain_db))?;
    put(&mut b, MAX_GAIN_STEP, f(cfg.max_gain_step_db))?;
    put(&mut b, MIN_TX_ATTEN, f(cfg.min_tx_atten_db))?;
    put(&mut b, MAX_TX_ATTEN, f(cfg.max_tx_atten_db))?;
    put(&mut b, DAMPING, f(0.1))?;
    put(&mut b, ORX_NOISE_TRACK, f(0.98))?;
    Ok(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHal;

    #[test]
    fn config_blocks_per_channel() {
        let mut hal = SimHal::new();
        let cfg = ClgcConfig {
            enable: true,
            expected_loop_gain_db: -12.5,
            ..ClgcConfig::default()
        };
        let mut clgc = Clgc::new(&mut hal);
        clgc.set_config(TxChannels::TX1 | TxChannels::TX3, &cfg).unwrap();
        assert_eq!(clgc.config(3).unwrap(), cfg);
        assert_eq!(clgc.config(1).unwrap(), cfg);
        assert!(!clgc.config(0).unwrap().enable);

        let obj = hal.config_object(OBJID_CLGC_TRACKING);
        let tx1 = &obj[56..56 + CLGC_CONFIG_SIZE];
        assert_eq!(tx1[6], 1);
        assert_eq!(tx1[7], 1);
        assert_eq!(u32::from_le_bytes([tx1[8], tx1[9], tx1[10], tx1[11]]), 514);
        assert_eq!(
            f32::from_le_bytes([tx1[48], tx1[49], tx1[50], tx1[51]]),
            0.98
        );
    }

    #[test]
    fn config_range_checks() {
        let mut hal = SimHal::new();
        let mut clgc = Clgc::new(&mut hal);
        for step in [0.0, 6.5] {
            let cfg = ClgcConfig {
                max_gain_step_db: step,
                ..ClgcConfig::default()
            };
            assert!(clgc.set_config(TxChannels::TX0, &cfg).is_err());
        }
        let cfg = ClgcConfig {
            min_tx_atten_db: 10.0,
            max_tx_atten_db: 5.0,
            ..ClgcConfig::default()
        };
        assert!(clgc.set_config(TxChannels::TX0, &cfg).is_err());
        assert!(clgc.set_config(TxChannels::empty(), &ClgcConfig::default()).is_err());
        assert!(clgc.config(4).is_err());
        assert!(hal.commands().is_empty());
    }

    #[test]
    fn status_decoding() {
        let mut hal = SimHal::new();
        hal.on_command(|mem, cmd| {
            if cmd.ext[0] == OBJID_CAL_STATUS && cmd.ext[1] == OBJID_CLGC_TRACKING {
                mem.set_u32(MAILBOX_GET + 12, 9);
                mem.set_u8(MAILBOX_GET + 20, 2);
                mem.set_u8(MAILBOX_GET + 24, 4);
                // Attenuation index 0x123 in bits 4..16.
                mem.write(MAILBOX_GET + 42, &[0x35, 0x12]);
                mem.set_u8(MAILBOX_GET + 44, 17);
                mem.write(MAILBOX_GET + 96, &0.5f32.to_le_bytes());
            }
            None
        });
        let s = Clgc::new(&mut hal).status(0).unwrap();
        assert_eq!(s.iter_count, 9);
        assert_eq!(s.state, ClgcRunState::TxAttenAtLowLimit);
        assert_eq!(s.capture_status, 4);
        assert_eq!(s.tx_atten_index, 0x123);
        assert_eq!(s.orx_gain_index, 17);
        assert_eq!(s.loop_gain, 0.5);
    }
}
