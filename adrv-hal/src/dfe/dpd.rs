/*!
Digital pre-distortion (DPD) tracking calibration.

Reached through [`Device::dpd`][crate::Device::dpd]. The co-processor runs the
adaptation; this API configures it and reads back its status. Recovery actions
are only ever *configured* here: when a fault condition trips, the firmware
applies the mapped [`DpdRecoveryActions`] by itself.
*/

use num_complex::Complex;
use tracing::debug;

use super::{check_tx, field, field_f32, put, windowed, TxChannels};
use crate::consts::*;
use crate::flags::bit_flags;
use crate::hal::Hal;
use crate::mailbox::Mailbox;
use crate::profile::layout::Field;
use crate::Error;

const CTRL_COEFF_SAVE: u8 = 0x01;
const CTRL_RESET: u8 = 0x11;
const CTRL_TRACKING_GET: u8 = 0x03;
const CTRL_TRACKING_SET: u8 = 0x13;
const CTRL_STABILITY_GET: u8 = 0x04;
const CTRL_STABILITY_SET: u8 = 0x14;
const CTRL_GAIN_MONITOR_GET: u8 = 0x05;
const CTRL_GAIN_MONITOR_SET: u8 = 0x15;

const COMPANDER_8_BIT: u8 = 0;

/// Number of filter coefficient weights in the tracking configuration.
pub const DPD_NUM_FILTER_WEIGHTS: usize = 15;

bit_flags! {
    /// DPD quality metrics, used both to select which metrics feed an error
    /// state and to report which metrics have tripped.
    pub struct DpdMetrics: u16 {
        /// Pre-actuator Tx RMS power.
        const MEAN_TU_POWER = 0x001;
        /// Pre-actuator Tx peak power.
        const PEAK_TU_POWER = 0x002;
        /// Post-actuator Tx RMS power.
        const MEAN_TX_POWER = 0x004;
        /// Post-actuator Tx peak power.
        const PEAK_TX_POWER = 0x008;
        /// Observed RMS power.
        const MEAN_ORX_POWER = 0x010;
        /// Observed peak power.
        const PEAK_ORX_POWER = 0x020;
        /// Tx to ORx EVM before the actuator.
        const DIRECT_EVM = 0x040;
        /// Tx to ORx EVM after the actuator.
        const INDIRECT_EVM = 0x080;
        /// Indirect error over samples above -30 dBFS.
        const SELECT_ERROR = 0x100;
        /// Indirect error.
        const INDIRECT_ERROR = 0x200;
    }
}

bit_flags! {
    /// Actions the firmware takes when a DPD error state is entered.
    pub struct DpdRecoveryActions: u16 {
        /// Don't apply the next LUT update.
        const SKIP_LUTS_UPDATE = 0x01;
        /// Revert the LUTs to unity gain.
        const REVERT_LUTS_TO_UNITY = 0x02;
        /// Reset the adaptation state.
        const RESET_ADAPTATION_STATE = 0x04;
        /// Switch to the max-power (M-table) model.
        const SWITCH_LUTS_TO_M = 0x08;
        /// Switch to the recovery (R-table) model.
        const SWITCH_LUTS_TO_R = 0x10;
        /// Attenuate the digital signal by 6 dB.
        const DIG_ATTEN_6DB = 0x20;
        /// Treat the next update as the first.
        const RESET_FIRST_DPD_FLAG = 0x40;
    }
}

/// A single DPD quality metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum DpdMetric {
    MeanTuPower,
    PeakTuPower,
    MeanTxPower,
    PeakTxPower,
    MeanOrxPower,
    PeakOrxPower,
    DirectEvm,
    IndirectEvm,
    SelectError,
    IndirectError,
}

impl DpdMetric {
    /// Every metric, in firmware order.
    pub const ALL: [DpdMetric; 10] = [
        Self::MeanTuPower,
        Self::PeakTuPower,
        Self::MeanTxPower,
        Self::PeakTxPower,
        Self::MeanOrxPower,
        Self::PeakOrxPower,
        Self::DirectEvm,
        Self::IndirectEvm,
        Self::SelectError,
        Self::IndirectError,
    ];

    fn index(self) -> u8 {
        self as u8
    }

    /// This metric as a one-element [`DpdMetrics`] set.
    pub fn flag(self) -> DpdMetrics {
        DpdMetrics::from_bits_truncate(1 << self.index())
    }

    fn stability_offset(self) -> u8 {
        8 * self.index()
    }
}

/// One of the four per-channel DPD error states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DpdErrorState {
    /// Threshold 0 was crossed.
    State0,
    /// Threshold 1 was crossed.
    State1,
    /// Threshold 0 was crossed `persistent_count` times in a row.
    Persistent0,
    /// Threshold 1 was crossed `persistent_count` times in a row.
    Persistent1,
}

impl DpdErrorState {
    fn stability_offset(self) -> u8 {
        match self {
            Self::State0 => 80,
            Self::Persistent0 => 84,
            Self::State1 => 88,
            Self::Persistent1 => 92,
        }
    }
}

/// How a fault condition compares a metric to its thresholds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DpdComparator {
    /// Trip when the metric falls below the threshold.
    #[default]
    LessThan,
    /// Trip when the metric rises above the threshold.
    GreaterThan,
}

/// Thresholds for one metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DpdFaultCondition {
    /// Metric being watched.
    pub metric: DpdMetric,
    /// Direction of the comparison.
    pub comparator: DpdComparator,
    /// Threshold for error state 0.
    pub threshold0: u16,
    /// Threshold for error state 1.
    pub threshold1: u16,
    /// Consecutive crossings before an error state becomes persistent.
    pub persistent_count: u16,
}

/// Which metrics lead into an error state, and what happens when it's
/// entered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DpdRecoveryActionConfig {
    /// Metrics whose crossings count toward this state.
    pub metrics: DpdMetrics,
    /// Actions applied on entering this state.
    pub actions: DpdRecoveryActions,
}

/// What [`Dpd::reset`] should do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DpdResetMode {
    /// Reset the DPD hardware and firmware.
    Full = 1,
    /// Restore the M-table LUTs.
    LutRestore = 2,
    /// Save the M-table coefficients.
    CoeffSave = 3,
    /// Restore the C-table LUTs.
    LutRestoreC = 4,
    /// Save the C-table coefficients.
    CoeffSaveC = 5,
    /// Restore the R-table LUTs.
    LutRestoreR = 6,
    /// Save the R-table coefficients.
    CoeffSaveR = 7,
}

impl DpdResetMode {
    fn command(self) -> (u8, u8) {
        match self {
            Self::CoeffSave => (CTRL_COEFF_SAVE, 0),
            Self::CoeffSaveC => (CTRL_COEFF_SAVE, 1),
            Self::CoeffSaveR => (CTRL_COEFF_SAVE, 2),
            other => (CTRL_RESET, other as u8),
        }
    }
}

/// One basis function of the DPD model.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DpdFeature {
    /// Memory term, `0..=15`.
    pub i: u8,
    /// Cross term, `0..=15`.
    pub j: u8,
    /// Power term, `0..=15`.
    pub k: u8,
    /// Target LUT, `0..=30`.
    pub lut: u8,
    /// Initial coefficient.
    pub coeff: Complex<f32>,
}

/// The DPD model: up to [`DPD_MAX_FEATURES`] basis features.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DpdModelConfig {
    /// Features in use.
    pub features: Vec<DpdFeature>,
}

/// DPD adaptation update mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum DpdUpdateMode {
    /// Update on every iteration.
    #[default]
    Mode0 = 0,
    /// Update when the M threshold is exceeded.
    Mode1 = 1,
    /// Update from the M table only.
    Mode2 = 2,
}

/// DPD tracking configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[allow(missing_docs)]
pub struct DpdTrackingConfig {
    pub update_mode: DpdUpdateMode,
    /// Must be below `0x7FFF_FFFF`.
    pub m_threshold: u32,
    pub samples: u16,
    /// Observation-bandwidth filter, 0 or 1.
    pub filter_sel: u16,
    pub filter_weights: [Complex<i8>; DPD_NUM_FILTER_WEIGHTS],
    pub direct_regularization: u8,
    /// Must be below 63.
    pub indirect_regularization: u8,
    /// At most 32768.
    pub min_avg_signal_level: u16,
    /// At most 32768.
    pub min_avg_signal_level_orx: u16,
    /// At most `0x4B_0000`.
    pub peak_search_window_size: u32,
    /// At most 100.
    pub mu: u8,
    pub direct_learning: bool,
    /// At most 63.
    pub indirect_regularization_low_power: u16,
}

/// Actuator gain-monitor configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct DpdGainMonitorConfig {
    pub qual_threshold: u16,
    pub lower_threshold: u8,
    pub upper_threshold: u8,
    pub enable: bool,
    pub iir_enable: bool,
    /// Model loaded when the lower threshold trips, `0..=3`.
    pub lower_model: u8,
    pub low_gain_auto_load: bool,
    /// Model loaded when the upper threshold trips, `0..=3`.
    pub upper_model: u8,
    pub high_gain_auto_load: bool,
    /// At most 16.
    pub iir_decay: u8,
}

/// Power and error statistics from the last DPD iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[allow(missing_docs)]
pub struct DpdStatistics {
    pub mean_tu_power: f32,
    pub peak_tu_power: f32,
    pub mean_tx_power: f32,
    pub peak_tx_power: f32,
    pub mean_orx_power: f32,
    pub peak_orx_power: f32,
    pub direct_evm: f32,
    pub indirect_evm: f32,
    pub select_error: f32,
    pub indirect_error: f32,
}

/// DPD tracking calibration status.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DpdStatus {
    /// Firmware error code, 0 if none.
    pub error_code: u32,
    /// Progress of the current iteration.
    pub percent_complete: u32,
    /// Performance metric of the last update.
    pub performance_metric: u32,
    /// Iterations run.
    pub iter_count: u32,
    /// Updates applied.
    pub update_count: u32,
    /// Active model table.
    pub model_table: u8,
    /// Statistics from the last iteration.
    pub statistics: DpdStatistics,
    /// Metrics that tripped, per error state, in the order error 0,
    /// persistent 0, error 1, persistent 1.
    pub metrics: [DpdMetrics; 4],
    /// Actions taken, in the same order as `metrics`.
    pub actions: [DpdRecoveryActions; 4],
    /// Synchronization status with the other tracking calibrations.
    pub sync_status: u32,
}

mod status {
    use crate::profile::layout::Field;

    pub const ERROR_CODE: Field = Field::new("error_code", 0, 4);
    pub const PERCENT_COMPLETE: Field = Field::new("percent_complete", 4, 4);
    pub const PERFORMANCE_METRIC: Field = Field::new("performance_metric", 8, 4);
    pub const ITER_COUNT: Field = Field::new("iter_count", 12, 4);
    pub const UPDATE_COUNT: Field = Field::new("update_count", 16, 4);
    pub const MODEL_TABLE: Field = Field::new("model_table", 44, 1);
    pub const STATISTICS: Field = Field::new("statistics", 48, 4);
    pub const METRICS_MASK: Field = Field::new("metrics_mask", 88, 2);
    pub const ACTION_MASK: Field = Field::new("action_mask", 100, 2);
    pub const SYNC_STATUS: Field = Field::new("sync_status", 108, 4);
}

mod tracking {
    use crate::profile::layout::Field;

    pub const SIZE: usize = 124;

    pub const MODEL: Field = Field::new("model", 0, 2);
    pub const UPDATE_MODE: Field = Field::new("update_mode", 2, 1);
    pub const DELTA: Field = Field::new("delta", 4, 1);
    pub const DECAY_P: Field = Field::new("decay_p", 5, 1);
    pub const MAG_SQ: Field = Field::new("mag_sq", 6, 2);
    pub const M_THRESHOLD: Field = Field::new("m_threshold", 8, 4);
    pub const SAMPLES: Field = Field::new("samples", 12, 2);
    pub const FILTER_SEL: Field = Field::new("filter_sel", 14, 2);
    pub const SELECTED_ERR_SAMPLES: Field = Field::new("selected_err_samples", 16, 2);
    pub const INDIRECT_ERR_SAMPLES: Field = Field::new("indirect_err_samples", 18, 2);
    pub const SATURATION_THRESHOLD: Field = Field::new("saturation_threshold", 20, 2);
    pub const OUTLIER_THRESHOLD: Field = Field::new("outlier_threshold", 22, 2);
    pub const SAT_TX_COUNT_LIMIT: Field = Field::new("sat_tx_count_limit", 24, 4);
    pub const SAT_ORX_COUNT_LIMIT: Field = Field::new("sat_orx_count_limit", 28, 4);
    pub const ERR_COUNT_LIMIT: Field = Field::new("err_count_limit", 32, 4);
    pub const SUB_ITERATIONS: Field = Field::new("sub_iterations", 36, 2);
    pub const LINEAR_TERM: Field = Field::new("linear_term", 38, 2);
    pub const FILTER_WEIGHT: Field = Field::new("filter_weight", 40, 1);
    pub const STARTUP_ITERATIONS: Field = Field::new("startup_iterations", 70, 2);
    pub const DIRECT_REG: Field = Field::new("direct_regularization", 72, 1);
    pub const INDIRECT_REG: Field = Field::new("indirect_regularization", 73, 1);
    pub const MIN_AVG_SIGNAL: Field = Field::new("min_avg_signal_level", 74, 2);
    pub const SELECTED_SIGNAL: Field = Field::new("selected_signal_level", 76, 2);
    pub const MIN_AVG_SIGNAL_ORX: Field = Field::new("min_avg_signal_level_orx", 78, 2);
    pub const PEAK_SEARCH_SIZE: Field = Field::new("peak_search_size", 80, 2);
    pub const MIN_RAND_DELAY: Field = Field::new("min_rand_capture_delay", 84, 2);
    pub const XCORR_TIMEOUT: Field = Field::new("xcorr_timeout", 86, 2);
    pub const PEAK_SEARCH_WINDOW: Field = Field::new("peak_search_window_size", 88, 4);
    pub const MU: Field = Field::new("mu", 92, 1);
    pub const DIRECT_LEARNING: Field = Field::new("direct_learning", 93, 1);
    pub const SAMPLES_PER_CAPTURE: Field = Field::new("samples_per_capture", 94, 2);
    pub const MAX_RAND_DELAY: Field = Field::new("max_rand_capture_delay", 96, 2);
    pub const CLGC_SYNC: Field = Field::new("clgc_sync", 98, 2);
    pub const INDIRECT_REG_LOW_POWER: Field =
        Field::new("indirect_regularization_low_power", 100, 2);

    /// Fields not exposed in the config, with the values the firmware expects.
    pub const FIXED: [(Field, u64); 21] = [
        (MODEL, 0x0010),
        (DELTA, 2),
        (DECAY_P, 2),
        (MAG_SQ, 0x40),
        (SELECTED_ERR_SAMPLES, 128),
        (INDIRECT_ERR_SAMPLES, 256),
        (SATURATION_THRESHOLD, 40000),
        (OUTLIER_THRESHOLD, 32768),
        (SAT_TX_COUNT_LIMIT, 1),
        (SAT_ORX_COUNT_LIMIT, 3),
        (ERR_COUNT_LIMIT, 2),
        (SUB_ITERATIONS, 1),
        (LINEAR_TERM, 1),
        (STARTUP_ITERATIONS, 3),
        (SELECTED_SIGNAL, 1024),
        (PEAK_SEARCH_SIZE, 32767),
        (MIN_RAND_DELAY, 32767),
        (XCORR_TIMEOUT, 1000),
        (SAMPLES_PER_CAPTURE, 4096),
        (MAX_RAND_DELAY, 32767),
        (CLGC_SYNC, 1),
    ];
}

const GAIN_MONITOR_SIZE: usize = 12;

/// DPD operations. Get one with [`Device::dpd`][crate::Device::dpd].
pub struct Dpd<'a, H: Hal + ?Sized> {
    mb: Mailbox<'a, H>,
}

impl<'a, H: Hal + ?Sized> Dpd<'a, H> {
    /// DPD operations on a bare HAL.
    pub fn new(hal: &'a mut H) -> Self {
        Self {
            mb: Mailbox::new(hal),
        }
    }

    fn for_each_tx(
        &mut self,
        mask: TxChannels,
        ctrl: u8,
        payload: &[u8],
    ) -> Result<(), Error> {
        for tx in mask.non_empty()?.indices() {
            self.mb
                .tracking_ctrl_set(OBJID_DPD_TRACKING, 1 << tx, ctrl, payload)?;
        }
        Ok(())
    }

    fn query(&mut self, tx: usize, ctrl: u8, offset: u8, len: usize) -> Result<Vec<u8>, Error> {
        check_tx(tx)?;
        self.mb.tracking_ctrl_get(
            OBJID_DPD_TRACKING,
            1 << tx,
            ctrl,
            &[offset, len as u8],
            len,
        )
    }

    /// Read the tracking calibration status of Tx channel `tx`.
    pub fn status(&mut self, tx: usize) -> Result<DpdStatus, Error> {
        check_tx(tx)?;
        let buf = self
            .mb
            .status_get(OBJID_DPD_TRACKING, tx as u8, DPD_STATUS_SIZE)?;
        let u32_at = |f: Field| field(&buf, f).map(|v| v as u32);

        let mut stats = [0f32; 10];
        for (i, s) in stats.iter_mut().enumerate() {
            *s = field_f32(&buf, status::STATISTICS.nth(i as u32, 4))?;
        }
        let mut metrics = [DpdMetrics::empty(); 4];
        let mut actions = [DpdRecoveryActions::empty(); 4];
        for i in 0..4 {
            let m = field(&buf, status::METRICS_MASK.nth(i as u32, 2))? as u16;
            let a = field(&buf, status::ACTION_MASK.nth(i as u32, 2))? as u16;
            metrics[i] = DpdMetrics::from_bits_truncate(m);
            actions[i] = DpdRecoveryActions::from_bits_truncate(a);
        }
        Ok(DpdStatus {
            error_code: u32_at(status::ERROR_CODE)?,
            percent_complete: u32_at(status::PERCENT_COMPLETE)?,
            performance_metric: u32_at(status::PERFORMANCE_METRIC)?,
            iter_count: u32_at(status::ITER_COUNT)?,
            update_count: u32_at(status::UPDATE_COUNT)?,
            model_table: field(&buf, status::MODEL_TABLE)? as u8,
            statistics: DpdStatistics {
                mean_tu_power: stats[0],
                peak_tu_power: stats[1],
                mean_tx_power: stats[2],
                peak_tx_power: stats[3],
                mean_orx_power: stats[4],
                peak_orx_power: stats[5],
                direct_evm: stats[6],
                indirect_evm: stats[7],
                select_error: stats[8],
                indirect_error: stats[9],
            },
            metrics,
            actions,
            sync_status: u32_at(status::SYNC_STATUS)?,
        })
    }

    /// Reset DPD on Tx channel `tx`, or save/restore one of its tables.
    pub fn reset(&mut self, tx: usize, mode: DpdResetMode) -> Result<(), Error> {
        check_tx(tx)?;
        let (ctrl, arg) = mode.command();
        debug!("DPD reset Tx{tx}: {mode:?}");
        self.mb
            .tracking_ctrl_set(OBJID_DPD_TRACKING, 1 << tx, ctrl, &[arg])
    }

    /// Program the DPD model.
    ///
    /// The feature table is uploaded in chunks of [`DPD_FEATURES_PER_CHUNK`]
    /// features after the 4-byte model header.
    ///
    /// # Errors
    ///
    /// [`Error::ValueRange`] if there are too many features or a feature
    /// index is out of range.
    pub fn set_model_config(&mut self, model: &DpdModelConfig) -> Result<(), Error> {
        let n = model.features.len();
        if n > DPD_MAX_FEATURES {
            return Err(Error::value_range(0..DPD_MAX_FEATURES as u32 + 1, n as u32));
        }
        for f in &model.features {
            for idx in [f.i, f.j, f.k] {
                if idx > 15 {
                    return Err(Error::value_range(0..16, idx));
                }
            }
            if f.lut > 30 {
                return Err(Error::value_range(0..31, f.lut));
            }
        }

        let mut table = Vec::with_capacity(n * DPD_FEATURE_SIZE);
        for f in &model.features {
            table.extend_from_slice(&[f.i, f.j, f.k, f.lut]);
            table.extend_from_slice(&f.coeff.re.to_le_bytes());
            table.extend_from_slice(&f.coeff.im.to_le_bytes());
        }

        self.mb
            .config_write(OBJID_DPD_TRACKING, 0, &[n as u8, 0, 0, COMPANDER_8_BIT])?;
        let chunk_bytes = DPD_FEATURES_PER_CHUNK * DPD_FEATURE_SIZE;
        for (i, chunk) in table.chunks(chunk_bytes).enumerate() {
            let offset = DPD_MODEL_METADATA_SIZE + i * chunk_bytes;
            self.mb
                .config_write(OBJID_DPD_TRACKING, offset as u16, chunk)?;
        }
        debug!("DPD model programmed with {n} features");
        Ok(())
    }

    /// Read back the DPD model.
    pub fn model_config(&mut self) -> Result<DpdModelConfig, Error> {
        let meta = self
            .mb
            .config_read(OBJID_DPD_TRACKING, 0, DPD_MODEL_METADATA_SIZE as u8)?;
        let n = meta[0] as usize;
        if n > DPD_MAX_FEATURES {
            return Err(Error::ReturnData);
        }
        let mut features = Vec::with_capacity(n);
        for i in 0..n {
            let offset = DPD_MODEL_METADATA_SIZE + i * DPD_FEATURE_SIZE;
            let b = self.mb.config_read(
                OBJID_DPD_TRACKING,
                offset as u16,
                DPD_FEATURE_SIZE as u8,
            )?;
            let f32_at = |o: usize| -> Result<f32, Error> {
                let bytes = b.get(o..o + 4).ok_or(Error::ReturnData)?;
                Ok(f32::from_le_bytes(
                    bytes.try_into().map_err(|_| Error::ReturnData)?,
                ))
            };
            features.push(DpdFeature {
                i: b[0],
                j: b[1],
                k: b[2],
                lut: b[3],
                coeff: Complex::new(f32_at(4)?, f32_at(8)?),
            });
        }
        Ok(DpdModelConfig { features })
    }

    /// Set the tracking configuration on every channel in `mask`.
    ///
    /// # Errors
    ///
    /// [`Error::ValueRange`] if any field is out of range. Nothing is sent
    /// in that case.
    pub fn set_tracking_config(
        &mut self,
        mask: TxChannels,
        cfg: &DpdTrackingConfig,
    ) -> Result<(), Error> {
        if cfg.m_threshold >= 0x7FFF_FFFF {
            return Err(Error::value_range(0..0x7FFF_FFFF, cfg.m_threshold));
        }
        if cfg.indirect_regularization >= 63 {
            return Err(Error::value_range(0..63, cfg.indirect_regularization));
        }
        if cfg.peak_search_window_size > 0x4B_0000 {
            return Err(Error::value_range(0..0x4B_0001, cfg.peak_search_window_size));
        }
        for level in [cfg.min_avg_signal_level, cfg.min_avg_signal_level_orx] {
            if level > 32768 {
                return Err(Error::value_range(0..32769, level));
            }
        }
        if cfg.filter_sel > 1 {
            return Err(Error::value_range(0..2, cfg.filter_sel));
        }
        if cfg.mu > 100 {
            return Err(Error::value_range(0..101, cfg.mu));
        }
        if cfg.indirect_regularization_low_power > 63 {
            return Err(Error::value_range(0..64, cfg.indirect_regularization_low_power));
        }

        let mut b = vec![0u8; tracking::SIZE];
        for (f, v) in tracking::FIXED {
            put(&mut b, f, v)?;
        }
        use tracking::*;
        put(&mut b, UPDATE_MODE, cfg.update_mode as u64)?;
        put(&mut b, M_THRESHOLD, cfg.m_threshold as u64)?;
        put(&mut b, SAMPLES, cfg.samples as u64)?;
        put(&mut b, FILTER_SEL, cfg.filter_sel as u64)?;
        for (i, w) in cfg.filter_weights.iter().enumerate() {
            put(&mut b, FILTER_WEIGHT.nth(2 * i as u32, 1), w.re as u8 as u64)?;
            put(&mut b, FILTER_WEIGHT.nth(2 * i as u32 + 1, 1), w.im as u8 as u64)?;
        }
        put(&mut b, DIRECT_REG, cfg.direct_regularization as u64)?;
        put(&mut b, INDIRECT_REG, cfg.indirect_regularization as u64)?;
        put(&mut b, MIN_AVG_SIGNAL, cfg.min_avg_signal_level as u64)?;
        put(&mut b, MIN_AVG_SIGNAL_ORX, cfg.min_avg_signal_level_orx as u64)?;
        put(&mut b, PEAK_SEARCH_WINDOW, cfg.peak_search_window_size as u64)?;
        put(&mut b, MU, cfg.mu as u64)?;
        put(&mut b, DIRECT_LEARNING, cfg.direct_learning as u64)?;
        put(
            &mut b,
            INDIRECT_REG_LOW_POWER,
            cfg.indirect_regularization_low_power as u64,
        )?;

        let payload = windowed(0, &b)?;
        self.for_each_tx(mask, CTRL_TRACKING_SET, &payload)
    }

    /// Read the tracking configuration of Tx channel `tx`.
    pub fn tracking_config(&mut self, tx: usize) -> Result<DpdTrackingConfig, Error> {
        use tracking::*;
        let b = self.query(tx, CTRL_TRACKING_GET, 0, SIZE)?;
        let get = |f: Field| field(&b, f);
        let update_mode = match get(UPDATE_MODE)? {
            0 => DpdUpdateMode::Mode0,
            1 => DpdUpdateMode::Mode1,
            2 => DpdUpdateMode::Mode2,
            _ => return Err(Error::ReturnData),
        };
        let mut filter_weights = [Complex::new(0i8, 0i8); DPD_NUM_FILTER_WEIGHTS];
        for (i, w) in filter_weights.iter_mut().enumerate() {
            w.re = get(FILTER_WEIGHT.nth(2 * i as u32, 1))? as u8 as i8;
            w.im = get(FILTER_WEIGHT.nth(2 * i as u32 + 1, 1))? as u8 as i8;
        }
        Ok(DpdTrackingConfig {
            update_mode,
            m_threshold: get(M_THRESHOLD)? as u32,
            samples: get(SAMPLES)? as u16,
            filter_sel: get(FILTER_SEL)? as u16,
            filter_weights,
            direct_regularization: get(DIRECT_REG)? as u8,
            indirect_regularization: get(INDIRECT_REG)? as u8,
            min_avg_signal_level: get(MIN_AVG_SIGNAL)? as u16,
            min_avg_signal_level_orx: get(MIN_AVG_SIGNAL_ORX)? as u16,
            peak_search_window_size: get(PEAK_SEARCH_WINDOW)? as u32,
            mu: get(MU)? as u8,
            direct_learning: get(DIRECT_LEARNING)? != 0,
            indirect_regularization_low_power: get(INDIRECT_REG_LOW_POWER)? as u16,
        })
    }

    /// Set the actuator gain-monitor configuration on every channel in
    /// `mask`.
    pub fn set_gain_monitor_config(
        &mut self,
        mask: TxChannels,
        cfg: &DpdGainMonitorConfig,
    ) -> Result<(), Error> {
        for model in [cfg.lower_model, cfg.upper_model] {
            if model > 3 {
                return Err(Error::value_range(0..4, model));
            }
        }
        if cfg.iir_decay > 16 {
            return Err(Error::value_range(0..17, cfg.iir_decay));
        }
        let [q0, q1] = cfg.qual_threshold.to_le_bytes();
        let body = [
            q0,
            q1,
            cfg.lower_threshold,
            cfg.upper_threshold,
            cfg.enable as u8,
            cfg.iir_enable as u8,
            !cfg.iir_enable as u8,
            cfg.lower_model,
            cfg.low_gain_auto_load as u8,
            cfg.upper_model,
            cfg.high_gain_auto_load as u8,
            cfg.iir_decay,
        ];
        let payload = windowed(0, &body)?;
        self.for_each_tx(mask, CTRL_GAIN_MONITOR_SET, &payload)
    }

    /// Read the actuator gain-monitor configuration of Tx channel `tx`.
    pub fn gain_monitor_config(&mut self, tx: usize) -> Result<DpdGainMonitorConfig, Error> {
        let b = self.query(tx, CTRL_GAIN_MONITOR_GET, 0, GAIN_MONITOR_SIZE)?;
        if b.len() < GAIN_MONITOR_SIZE {
            return Err(Error::ReturnData);
        }
        Ok(DpdGainMonitorConfig {
            qual_threshold: u16::from_le_bytes([b[0], b[1]]),
            lower_threshold: b[2],
            upper_threshold: b[3],
            enable: b[4] != 0,
            iir_enable: b[5] != 0,
            lower_model: b[7],
            low_gain_auto_load: b[8] != 0,
            upper_model: b[9],
            high_gain_auto_load: b[10] != 0,
            iir_decay: b[11],
        })
    }

    /// Set the thresholds for one metric on every channel in `mask`.
    pub fn set_fault_condition(
        &mut self,
        mask: TxChannels,
        cond: &DpdFaultCondition,
    ) -> Result<(), Error> {
        let [t00, t01] = cond.threshold0.to_le_bytes();
        let [t10, t11] = cond.threshold1.to_le_bytes();
        let [p0, p1] = cond.persistent_count.to_le_bytes();
        let body = [cond.comparator as u8, 0, t00, t01, t10, t11, p0, p1];
        let payload = windowed(cond.metric.stability_offset(), &body)?;
        self.for_each_tx(mask, CTRL_STABILITY_SET, &payload)
    }

    /// Read the thresholds for `metric` on Tx channel `tx`.
    pub fn fault_condition(
        &mut self,
        tx: usize,
        metric: DpdMetric,
    ) -> Result<DpdFaultCondition, Error> {
        let b = self.query(tx, CTRL_STABILITY_GET, metric.stability_offset(), 8)?;
        if b.len() < 8 {
            return Err(Error::ReturnData);
        }
        let comparator = match b[0] {
            0 => DpdComparator::LessThan,
            1 => DpdComparator::GreaterThan,
            _ => return Err(Error::ReturnData),
        };
        Ok(DpdFaultCondition {
            metric,
            comparator,
            threshold0: u16::from_le_bytes([b[2], b[3]]),
            threshold1: u16::from_le_bytes([b[4], b[5]]),
            persistent_count: u16::from_le_bytes([b[6], b[7]]),
        })
    }

    /// Map an error state to its metrics and recovery actions on every
    /// channel in `mask`.
    pub fn set_recovery_action(
        &mut self,
        mask: TxChannels,
        state: DpdErrorState,
        cfg: &DpdRecoveryActionConfig,
    ) -> Result<(), Error> {
        let [m0, m1] = cfg.metrics.bits().to_le_bytes();
        let [a0, a1] = cfg.actions.bits().to_le_bytes();
        let payload = windowed(state.stability_offset(), &[m0, m1, a0, a1])?;
        self.for_each_tx(mask, CTRL_STABILITY_SET, &payload)
    }

    /// Read the mapping for `state` on Tx channel `tx`.
    ///
    /// # Errors
    ///
    /// [`Error::ReturnData`] if the firmware reports bits outside the known
    /// metric or action sets.
    pub fn recovery_action(
        &mut self,
        tx: usize,
        state: DpdErrorState,
    ) -> Result<DpdRecoveryActionConfig, Error> {
        let b = self.query(tx, CTRL_STABILITY_GET, state.stability_offset(), 4)?;
        if b.len() < 4 {
            return Err(Error::ReturnData);
        }
        let metrics = DpdMetrics::from_bits(u16::from_le_bytes([b[0], b[1]]))
            .ok_or(Error::ReturnData)?;
        let actions = DpdRecoveryActions::from_bits(u16::from_le_bytes([b[2], b[3]]))
            .ok_or(Error::ReturnData)?;
        Ok(DpdRecoveryActionConfig { metrics, actions })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::sim::{Command, SimHal, SimMemory};

    /// Emulate the firmware's tracking-cal control block: set commands
    /// (`0x10` flag) store `{offset, len, data}`, get commands reply with the
    /// requested window in place of the request.
    fn tracking_store(hal: &mut SimHal) {
        let mut store: HashMap<u8, Vec<u8>> = HashMap::new();
        hal.on_command(move |mem: &mut SimMemory, cmd: &Command| {
            if cmd.opcode != OPCODE_SET || cmd.ext[0] != OBJID_TRACKING_CAL_CTRL {
                return None;
            }
            let chan = cmd.ext[2];
            let ctrl = cmd.ext[3];
            let off = mem.u8(MAILBOX_SET) as usize;
            let len = mem.u8(MAILBOX_SET + 1) as usize;
            let key = chan << 4 | (ctrl & 0x0F);
            let blob = store.entry(key).or_insert_with(|| vec![0; 256]);
            if ctrl & 0x10 != 0 {
                let mut data = vec![0u8; len];
                mem.read(MAILBOX_SET + 2, &mut data);
                blob[off..off + len].copy_from_slice(&data);
            } else {
                mem.write(MAILBOX_SET, &blob[off..off + len]);
            }
            Some(0)
        });
    }

    #[test]
    fn status_decoding() {
        let mut hal = SimHal::new();
        hal.on_command(|mem, cmd| {
            if cmd.ext[0] == OBJID_CAL_STATUS && cmd.ext[2] == 5 {
                mem.set_u32(MAILBOX_GET, 7);
                mem.set_u32(MAILBOX_GET + 12, 42);
                mem.set_u8(MAILBOX_GET + 44, 1);
                mem.write(MAILBOX_GET + 52, &(-3.5f32).to_le_bytes());
                mem.write(MAILBOX_GET + 92, &0x0041u16.to_le_bytes());
                mem.write(MAILBOX_GET + 104, &0x0005u16.to_le_bytes());
                mem.set_u32(MAILBOX_GET + 108, 1);
            }
            None
        });
        let status = Dpd::new(&mut hal).status(5).unwrap();
        assert_eq!(status.error_code, 7);
        assert_eq!(status.iter_count, 42);
        assert_eq!(status.model_table, 1);
        assert_eq!(status.statistics.peak_tu_power, -3.5);
        assert_eq!(status.metrics[2], DpdMetrics::MEAN_TU_POWER | DpdMetrics::DIRECT_EVM);
        assert_eq!(
            status.actions[2],
            DpdRecoveryActions::SKIP_LUTS_UPDATE | DpdRecoveryActions::RESET_ADAPTATION_STATE
        );
        assert_eq!(status.sync_status, 1);
        assert!(Dpd::new(&mut hal).status(8).is_err());
    }

    #[test]
    fn reset_commands() {
        let mut hal = SimHal::new();
        let mut dpd = Dpd::new(&mut hal);
        dpd.reset(1, DpdResetMode::CoeffSaveC).unwrap();
        dpd.reset(3, DpdResetMode::Full).unwrap();
        let cmds = hal.commands();
        assert_eq!(cmds[0].ext, [OBJID_TRACKING_CAL_CTRL, OBJID_DPD_TRACKING, 0x2, 0x01]);
        assert_eq!(cmds[1].ext, [OBJID_TRACKING_CAL_CTRL, OBJID_DPD_TRACKING, 0x8, 0x11]);
        assert_eq!(hal.mem().u8(MAILBOX_SET), 1);
    }

    #[test]
    fn model_config_chunks() {
        let mut hal = SimHal::new();
        let features = (0..45)
            .map(|n| DpdFeature {
                i: (n % 16) as u8,
                j: 1,
                k: 2,
                lut: (n % 31) as u8,
                coeff: Complex::new(n as f32, -(n as f32)),
            })
            .collect();
        let model = DpdModelConfig { features };
        let mut dpd = Dpd::new(&mut hal);
        dpd.set_model_config(&model).unwrap();
        assert_eq!(dpd.model_config().unwrap(), model);
        // Header, two full chunks and a remainder, then the reads.
        let writes = hal
            .commands()
            .iter()
            .filter(|c| c.opcode == OPCODE_SET)
            .count();
        assert_eq!(writes, 4);
        assert_eq!(&hal.config_object(OBJID_DPD_TRACKING)[..4], &[45, 0, 0, 0]);

        let bad = DpdModelConfig {
            features: vec![DpdFeature {
                k: 16,
                ..DpdFeature::default()
            }],
        };
        assert!(matches!(
            Dpd::new(&mut hal).set_model_config(&bad),
            Err(Error::ValueRange { .. })
        ));
    }

    #[test]
    fn tracking_config_round_trip() {
        let mut hal = SimHal::new();
        tracking_store(&mut hal);
        let mut cfg = DpdTrackingConfig {
            update_mode: DpdUpdateMode::Mode2,
            m_threshold: 0x1234_5678,
            samples: 4096,
            filter_sel: 1,
            mu: 50,
            direct_learning: true,
            peak_search_window_size: 0x10000,
            indirect_regularization_low_power: 20,
            ..DpdTrackingConfig::default()
        };
        cfg.filter_weights[3] = Complex::new(-2, 5);
        let mut dpd = Dpd::new(&mut hal);
        dpd.set_tracking_config(TxChannels::TX1 | TxChannels::TX2, &cfg)
            .unwrap();
        assert_eq!(dpd.tracking_config(2).unwrap(), cfg);
        assert_eq!(dpd.tracking_config(1).unwrap(), cfg);

        cfg.mu = 101;
        assert!(dpd.set_tracking_config(TxChannels::TX0, &cfg).is_err());
        assert!(dpd
            .set_tracking_config(TxChannels::empty(), &DpdTrackingConfig::default())
            .is_err());
    }

    #[test]
    fn gain_monitor_bypass_is_inverse() {
        let mut hal = SimHal::new();
        tracking_store(&mut hal);
        let cfg = DpdGainMonitorConfig {
            qual_threshold: 0x0102,
            iir_enable: true,
            upper_model: 3,
            iir_decay: 16,
            ..DpdGainMonitorConfig::default()
        };
        Dpd::new(&mut hal)
            .set_gain_monitor_config(TxChannels::TX0, &cfg)
            .unwrap();
        // {offset, len} header, then the body. Bypass is body[6].
        assert_eq!(hal.mem().u8(MAILBOX_SET + 2 + 5), 1);
        assert_eq!(hal.mem().u8(MAILBOX_SET + 2 + 6), 0);
        assert_eq!(Dpd::new(&mut hal).gain_monitor_config(0).unwrap(), cfg);

        let bad = DpdGainMonitorConfig {
            iir_decay: 17,
            ..cfg
        };
        assert!(Dpd::new(&mut hal)
            .set_gain_monitor_config(TxChannels::TX0, &bad)
            .is_err());
    }

    #[test]
    fn stability_config() {
        let mut hal = SimHal::new();
        tracking_store(&mut hal);
        let mut dpd = Dpd::new(&mut hal);
        let cond = DpdFaultCondition {
            metric: DpdMetric::IndirectEvm,
            comparator: DpdComparator::GreaterThan,
            threshold0: 100,
            threshold1: 200,
            persistent_count: 3,
        };
        dpd.set_fault_condition(TxChannels::TX3, &cond).unwrap();
        assert_eq!(dpd.fault_condition(3, DpdMetric::IndirectEvm).unwrap(), cond);

        let actions = DpdRecoveryActionConfig {
            metrics: DpdMetric::IndirectEvm.flag() | DpdMetrics::SELECT_ERROR,
            actions: DpdRecoveryActions::REVERT_LUTS_TO_UNITY
                | DpdRecoveryActions::SWITCH_LUTS_TO_R,
        };
        dpd.set_recovery_action(TxChannels::TX3, DpdErrorState::Persistent1, &actions)
            .unwrap();
        assert_eq!(
            dpd.recovery_action(3, DpdErrorState::Persistent1).unwrap(),
            actions
        );
        assert_eq!(
            dpd.recovery_action(3, DpdErrorState::State0).unwrap(),
            DpdRecoveryActionConfig::default()
        );
        assert_eq!(DpdMetric::IndirectEvm.stability_offset(), 56);
        assert_eq!(DpdErrorState::Persistent1.stability_offset(), 92);
    }
}
