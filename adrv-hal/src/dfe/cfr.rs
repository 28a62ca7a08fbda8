/*!
Crest factor reduction (CFR).

Each Tx channel has three CFR engines fed by a shared correction pulse. The
pulse is either one full-length pulse of up to [`CFR_MAX_PULSE_LEN`]
coefficients or, for carrier configurations that need it, two half pulses of
equal length that are concatenated and written together:

```
use adrv_hal::dfe::cfr::{concatenate_pulses, CorrectionPulse};
use num_complex::Complex;

let half = CorrectionPulse::new(vec![Complex::new(100, -20); 200]);
let both = concatenate_pulses(&half, &half).unwrap();
assert_eq!(both.num_coeffs, 200);
assert_eq!(both.coeffs.len(), 400);
```
*/

use num_complex::Complex;
use tracing::debug;

use super::{check_tx, TxChannels};
use crate::consts::*;
use crate::hal::Hal;
use crate::mailbox::Mailbox;
use crate::Error;

const CMD_PULSE_MODE: u8 = 0;
const CMD_PULSE_DONE: u8 = 1;
const CMD_THRESHOLD: u8 = 2;
const CMD_INTERPOLATION: u8 = 3;
const CMD_ENGINE_ENABLE: u8 = 4;
const CMD_BYPASS_ENABLE: u8 = 5;
const CMD_HARD_CLIP_ENABLE: u8 = 6;
const CMD_DELAY: u8 = 7;
const CMD_MAX_PEAKS: u8 = 10;
const CMD_SET: u8 = 0x80;

const PULSE_MODE_1: u32 = 0;
const PULSE_MODE_1A: u8 = 3;

/// Most peaks an engine may correct per window.
pub const CFR_MAX_PEAKS: u8 = 5;

// Offsets into the CFR status block.
const STATUS_SIZE: usize = 88;
const STATUS_PULSE_MODE: usize = 20;
const STATUS_HARD_CLIP: usize = 60;
const STATUS_INTERPOLATION: usize = 65;
const STATUS_ENABLE: usize = 66;
const STATUS_BYPASS: usize = 69;
const STATUS_MAX_PEAKS: usize = 75;
const STATUS_DELAY: usize = 84;

/// A CFR correction pulse, as complex 16-bit coefficients.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CorrectionPulse {
    /// Coefficients, in order.
    pub coeffs: Vec<Complex<i16>>,
}

impl CorrectionPulse {
    /// Wrap a list of coefficients.
    pub fn new(coeffs: Vec<Complex<i16>>) -> Self {
        Self { coeffs }
    }

    /// Number of coefficients.
    pub fn len(&self) -> usize {
        self.coeffs.len()
    }

    /// True if the pulse has no coefficients.
    pub fn is_empty(&self) -> bool {
        self.coeffs.is_empty()
    }
}

/// Two half pulses joined for a single transfer.
///
/// `num_coeffs` is the half-pulse length, which is what the firmware is told;
/// `coeffs` holds both halves back to back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConcatenatedPulse {
    /// Length of each half.
    pub num_coeffs: u16,
    /// First half followed by the second.
    pub coeffs: Vec<Complex<i16>>,
}

/// Join two half pulses.
///
/// # Errors
///
/// [`Error::ValueRange`] if either half is longer than
/// [`CFR_MAX_HALF_PULSE_LEN`], and [`Error::InvalidParameter`] if the two
/// halves differ in length.
pub fn concatenate_pulses(
    first: &CorrectionPulse,
    second: &CorrectionPulse,
) -> Result<ConcatenatedPulse, Error> {
    for half in [first, second] {
        if half.len() > CFR_MAX_HALF_PULSE_LEN {
            return Err(Error::value_range(
                0..CFR_MAX_HALF_PULSE_LEN as u32 + 1,
                half.len() as u32,
            ));
        }
    }
    if first.len() != second.len() {
        return Err(Error::InvalidParameter("half pulses differ in length"));
    }
    let mut coeffs = Vec::with_capacity(first.len() * 2);
    coeffs.extend_from_slice(&first.coeffs);
    coeffs.extend_from_slice(&second.coeffs);
    Ok(ConcatenatedPulse {
        num_coeffs: first.len() as u16,
        coeffs,
    })
}

/// CFR control configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CfrCtrlConfig {
    /// Target peak threshold.
    pub peak_threshold: f32,
    /// Per-engine scaling of the peak threshold.
    pub engine_threshold_scalers: [f32; CFR_NUM_ENGINES],
    /// Scaling of the correction threshold.
    pub correction_threshold_scaler: f32,
    /// Interpolation factor selection, `0..=3`.
    pub interpolation: u8,
    /// Tx delay applied on every engine.
    pub delay: u16,
    /// Peaks corrected per engine, each at most [`CFR_MAX_PEAKS`].
    pub max_peaks: [u8; CFR_NUM_ENGINES],
}

/// Per-engine enable and bypass settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CfrEnable {
    /// Engine enables.
    pub engine: [bool; CFR_NUM_ENGINES],
    /// Engine bypasses.
    pub bypass: [bool; CFR_NUM_ENGINES],
}

/// Hard-clipper settings.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CfrHardClipper {
    /// Clip on or off.
    pub enable: bool,
    /// Normalized clip threshold, `0 < threshold <= 1`.
    pub threshold: f32,
}

fn le_f32(b: &[u8], off: usize) -> Result<f32, Error> {
    let bytes = b.get(off..off + 4).ok_or(Error::ReturnData)?;
    Ok(f32::from_le_bytes(
        bytes.try_into().map_err(|_| Error::ReturnData)?,
    ))
}

/// CFR operations. Get one with [`Device::cfr`][crate::Device::cfr].
pub struct Cfr<'a, H: Hal + ?Sized> {
    mb: Mailbox<'a, H>,
}

impl<'a, H: Hal + ?Sized> Cfr<'a, H> {
    /// CFR operations on a bare HAL.
    pub fn new(hal: &'a mut H) -> Self {
        Self {
            mb: Mailbox::new(hal),
        }
    }

    /// Run CFR control sub-command `sub_cmd` with `data` on every channel in
    /// `mask`, in ascending order.
    pub fn ctrl_cmd_execute(
        &mut self,
        mask: TxChannels,
        sub_cmd: u8,
        data: &[u8],
    ) -> Result<(), Error> {
        for tx in mask.non_empty()?.indices() {
            self.mb.tracking_ctrl_set(
                OBJID_CFR_INIT,
                1 << tx,
                CMD_SET | sub_cmd,
                data,
            )?;
        }
        Ok(())
    }

    /// Read `len` bytes of CFR control sub-command `sub_cmd` state from Tx
    /// channel `tx`.
    pub fn ctrl_cmd_get(&mut self, tx: usize, sub_cmd: u8, len: usize) -> Result<Vec<u8>, Error> {
        check_tx(tx)?;
        self.mb
            .tracking_ctrl_get(OBJID_CFR_INIT, 1 << tx, sub_cmd, &[], len)
    }

    fn status(&mut self, tx: usize) -> Result<Vec<u8>, Error> {
        check_tx(tx)?;
        self.mb.status_get(OBJID_CFR_INIT, tx as u8, STATUS_SIZE)
    }

    /// Configure the hard clipper on every channel in `mask`.
    pub fn set_hard_clipper(
        &mut self,
        mask: TxChannels,
        cfg: &CfrHardClipper,
    ) -> Result<(), Error> {
        if !(cfg.threshold > 0.0 && cfg.threshold <= 1.0) {
            return Err(Error::InvalidParameter(
                "hard clipper threshold must be in (0, 1]",
            ));
        }
        let mut data = cfg.threshold.to_le_bytes().to_vec();
        data.push(cfg.enable as u8);
        self.ctrl_cmd_execute(mask, CMD_HARD_CLIP_ENABLE, &data)
    }

    /// Read the hard-clipper settings of Tx channel `tx`.
    pub fn hard_clipper(&mut self, tx: usize) -> Result<CfrHardClipper, Error> {
        let b = self.status(tx)?;
        Ok(CfrHardClipper {
            threshold: le_f32(&b, STATUS_HARD_CLIP)?,
            enable: b[STATUS_HARD_CLIP + 4] != 0,
        })
    }

    /// Program the control configuration on every channel in `mask`.
    ///
    /// The pulse mode is always set to mode 1A first. Nothing is sent if
    /// any field is out of range.
    pub fn set_ctrl_config(&mut self, mask: TxChannels, cfg: &CfrCtrlConfig) -> Result<(), Error> {
        if cfg.interpolation > 3 {
            return Err(Error::value_range(0..4, cfg.interpolation));
        }
        for peaks in cfg.max_peaks {
            if peaks > CFR_MAX_PEAKS {
                return Err(Error::value_range(0..CFR_MAX_PEAKS as u32 + 1, peaks));
            }
        }
        mask.non_empty()?;

        let mut thresholds = Vec::with_capacity(20);
        thresholds.extend_from_slice(&cfg.peak_threshold.to_le_bytes());
        for s in cfg.engine_threshold_scalers {
            thresholds.extend_from_slice(&s.to_le_bytes());
        }
        thresholds.extend_from_slice(&cfg.correction_threshold_scaler.to_le_bytes());
        let delay: Vec<u8> = (0..CFR_NUM_ENGINES)
            .flat_map(|_| cfg.delay.to_le_bytes())
            .collect();

        self.ctrl_cmd_execute(mask, CMD_PULSE_MODE, &[PULSE_MODE_1A])?;
        self.ctrl_cmd_execute(mask, CMD_THRESHOLD, &thresholds)?;
        self.ctrl_cmd_execute(mask, CMD_INTERPOLATION, &[cfg.interpolation])?;
        self.ctrl_cmd_execute(mask, CMD_DELAY, &delay)?;
        self.ctrl_cmd_execute(mask, CMD_MAX_PEAKS, &cfg.max_peaks)
    }

    /// Read the control configuration of Tx channel `tx`.
    ///
    /// # Errors
    ///
    /// [`Error::ReturnData`] if the channel is in a pulse mode other than 1
    /// or 1A.
    pub fn ctrl_config(&mut self, tx: usize) -> Result<CfrCtrlConfig, Error> {
        let s = self.status(tx)?;
        let mode = u32::from_le_bytes([
            s[STATUS_PULSE_MODE],
            s[STATUS_PULSE_MODE + 1],
            s[STATUS_PULSE_MODE + 2],
            s[STATUS_PULSE_MODE + 3],
        ]);
        if mode != PULSE_MODE_1 && mode != PULSE_MODE_1A as u32 {
            return Err(Error::ReturnData);
        }
        let t = self.ctrl_cmd_get(tx, CMD_THRESHOLD, 20)?;
        let mut max_peaks = [0u8; CFR_NUM_ENGINES];
        max_peaks.copy_from_slice(&s[STATUS_MAX_PEAKS..STATUS_MAX_PEAKS + CFR_NUM_ENGINES]);
        Ok(CfrCtrlConfig {
            peak_threshold: le_f32(&t, 0)?,
            engine_threshold_scalers: [le_f32(&t, 4)?, le_f32(&t, 8)?, le_f32(&t, 12)?],
            correction_threshold_scaler: le_f32(&t, 16)?,
            interpolation: s[STATUS_INTERPOLATION],
            delay: u16::from_le_bytes([s[STATUS_DELAY], s[STATUS_DELAY + 1]]),
            max_peaks,
        })
    }

    /// Set the engine enables and bypasses on every channel in `mask`.
    pub fn set_enable(&mut self, mask: TxChannels, cfg: &CfrEnable) -> Result<(), Error> {
        self.ctrl_cmd_execute(mask, CMD_ENGINE_ENABLE, &cfg.engine.map(|e| e as u8))?;
        self.ctrl_cmd_execute(mask, CMD_BYPASS_ENABLE, &cfg.bypass.map(|e| e as u8))
    }

    /// Set the correction pulse interpolation on every channel in `mask`.
    pub fn set_interpolation(&mut self, mask: TxChannels, interpolation: u8) -> Result<(), Error> {
        self.ctrl_cmd_execute(mask, CMD_INTERPOLATION, &[interpolation])
    }

    /// Read the engine enables and bypasses of Tx channel `tx`.
    pub fn enable(&mut self, tx: usize) -> Result<CfrEnable, Error> {
        let s = self.status(tx)?;
        let bit = |off: usize| s[off] & 1 != 0;
        Ok(CfrEnable {
            engine: [bit(STATUS_ENABLE), bit(STATUS_ENABLE + 1), bit(STATUS_ENABLE + 2)],
            bypass: [bit(STATUS_BYPASS), bit(STATUS_BYPASS + 1), bit(STATUS_BYPASS + 2)],
        })
    }

    fn write_pulse_ram(
        &mut self,
        mask: TxChannels,
        coeffs: &[Complex<i16>],
        done_len: u16,
    ) -> Result<(), Error> {
        let mask = mask.non_empty()?;
        let base = self.mb.hal().read_u32(ADDR_CFR_PULSE)?;
        self.ctrl_cmd_execute(TxChannels::all(), CMD_PULSE_MODE, &[PULSE_MODE_1A])?;

        let mut ram = Vec::with_capacity(coeffs.len() * 4);
        for c in coeffs {
            ram.extend_from_slice(&c.re.to_le_bytes());
            ram.extend_from_slice(&c.im.wrapping_neg().to_le_bytes());
        }
        for tx in mask.indices() {
            let addr = base + tx as u32 * CFR_PULSE_RAM_STRIDE;
            debug!(
                "CFR pulse: {} coefficients to Tx{tx} at 0x{addr:08x}",
                coeffs.len()
            );
            self.mb.mem_write(addr, &ram)?;
        }
        let [lo, hi] = done_len.to_le_bytes();
        self.ctrl_cmd_execute(mask, CMD_PULSE_DONE, &[lo, hi, 0])
    }

    /// Program one full-length correction pulse on every channel in `mask`.
    ///
    /// # Errors
    ///
    /// [`Error::ValueRange`] if the pulse is longer than
    /// [`CFR_MAX_PULSE_LEN`].
    pub fn write_correction_pulse(
        &mut self,
        mask: TxChannels,
        pulse: &CorrectionPulse,
    ) -> Result<(), Error> {
        if pulse.len() > CFR_MAX_PULSE_LEN {
            return Err(Error::value_range(
                0..CFR_MAX_PULSE_LEN as u32 + 1,
                pulse.len() as u32,
            ));
        }
        self.write_pulse_ram(mask, &pulse.coeffs, pulse.len() as u16)
    }

    /// Program either one full pulse or two equal half pulses.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] for any pulse count other than 1 or 2, and
    /// the errors of [`concatenate_pulses`] for a bad pair.
    pub fn write_correction_pulses(
        &mut self,
        mask: TxChannels,
        pulses: &[CorrectionPulse],
    ) -> Result<(), Error> {
        match pulses {
            [one] => self.write_correction_pulse(mask, one),
            [first, second] => {
                let joined = concatenate_pulses(first, second)?;
                self.write_pulse_ram(mask, &joined.coeffs, joined.num_coeffs)
            }
            _ => Err(Error::InvalidParameter("expected one or two correction pulses")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHal;

    fn pulse(n: usize, seed: i16) -> CorrectionPulse {
        CorrectionPulse::new(
            (0..n as i16)
                .map(|i| Complex::new(seed + i, -(seed + 2 * i)))
                .collect(),
        )
    }

    #[test]
    fn concatenation() {
        let a = pulse(200, 1);
        let b = pulse(200, 1000);
        let joined = concatenate_pulses(&a, &b).unwrap();
        assert_eq!(joined.num_coeffs, 200);
        assert_eq!(&joined.coeffs[..200], a.coeffs.as_slice());
        assert_eq!(&joined.coeffs[200..], b.coeffs.as_slice());

        assert!(matches!(
            concatenate_pulses(&pulse(200, 0), &pulse(199, 0)),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            concatenate_pulses(&pulse(257, 0), &pulse(257, 0)),
            Err(Error::ValueRange { .. })
        ));
    }

    #[test]
    fn sub_command_encoding() {
        let mut hal = SimHal::new();
        Cfr::new(&mut hal)
            .ctrl_cmd_execute(TxChannels::TX0 | TxChannels::TX3, CMD_INTERPOLATION, &[2])
            .unwrap();
        let ext: Vec<_> = hal.commands().iter().map(|c| c.ext).collect();
        // Each channel gets a fresh 0x80 | sub, never an accumulation.
        assert_eq!(
            ext,
            vec![
                [OBJID_TRACKING_CAL_CTRL, OBJID_CFR_INIT, 0x1, 0x83],
                [OBJID_TRACKING_CAL_CTRL, OBJID_CFR_INIT, 0x8, 0x83],
            ]
        );
    }

    #[test]
    fn hard_clipper() {
        let mut hal = SimHal::new();
        hal.on_command(|mem, cmd| {
            if cmd.ext[0] == OBJID_CAL_STATUS && cmd.ext[1] == OBJID_CFR_INIT {
                mem.write(MAILBOX_GET + 60, &0.75f32.to_le_bytes());
                mem.set_u8(MAILBOX_GET + 64, 1);
            }
            None
        });
        let mut cfr = Cfr::new(&mut hal);
        let cfg = CfrHardClipper {
            enable: true,
            threshold: 0.75,
        };
        cfr.set_hard_clipper(TxChannels::TX1, &cfg).unwrap();
        assert_eq!(cfr.hard_clipper(1).unwrap(), cfg);
        for threshold in [0.0, 1.5, f32::NAN] {
            let bad = CfrHardClipper { threshold, ..cfg };
            assert!(cfr.set_hard_clipper(TxChannels::TX1, &bad).is_err());
        }
        assert_eq!(&hal.mem().u32(MAILBOX_SET).to_le_bytes(), &0.75f32.to_le_bytes());
        assert_eq!(hal.mem().u8(MAILBOX_SET + 4), 1);
    }

    #[test]
    fn ctrl_config_order() {
        let mut hal = SimHal::new();
        let cfg = CfrCtrlConfig {
            peak_threshold: 0.5,
            engine_threshold_scalers: [1.0, 0.9, 0.8],
            correction_threshold_scaler: 1.1,
            interpolation: 1,
            delay: 12,
            max_peaks: [5, 4, 3],
        };
        Cfr::new(&mut hal)
            .set_ctrl_config(TxChannels::TX2, &cfg)
            .unwrap();
        let subs: Vec<_> = hal.commands().iter().map(|c| c.ext[3] & 0x7F).collect();
        assert_eq!(
            subs,
            vec![CMD_PULSE_MODE, CMD_THRESHOLD, CMD_INTERPOLATION, CMD_DELAY, CMD_MAX_PEAKS]
        );
        let mut last = [0u8; 3];
        hal.mem().read(MAILBOX_SET, &mut last);
        assert_eq!(last, [5, 4, 3]);

        let bad = CfrCtrlConfig {
            max_peaks: [6, 0, 0],
            ..cfg
        };
        hal.clear_ops();
        assert!(Cfr::new(&mut hal).set_ctrl_config(TxChannels::TX2, &bad).is_err());
        assert!(hal.commands().is_empty());
    }

    #[test]
    fn ctrl_config_readback() {
        let mut hal = SimHal::new();
        hal.on_command(|mem, cmd| {
            if cmd.ext[0] == OBJID_CAL_STATUS {
                mem.set_u32(MAILBOX_GET + 20, 3);
                mem.set_u8(MAILBOX_GET + 65, 2);
                mem.write(MAILBOX_GET + 75, &[1, 2, 3]);
                mem.write(MAILBOX_GET + 84, &300u16.to_le_bytes());
            } else if cmd.ext[1] == OBJID_CFR_INIT && cmd.ext[3] == CMD_THRESHOLD {
                for (i, v) in [0.25f32, 1.0, 1.0, 1.0, 0.5].iter().enumerate() {
                    mem.write(MAILBOX_SET + 4 * i as u32, &v.to_le_bytes());
                }
            }
            None
        });
        let cfg = Cfr::new(&mut hal).ctrl_config(0).unwrap();
        assert_eq!(cfg.peak_threshold, 0.25);
        assert_eq!(cfg.correction_threshold_scaler, 0.5);
        assert_eq!(cfg.interpolation, 2);
        assert_eq!(cfg.delay, 300);
        assert_eq!(cfg.max_peaks, [1, 2, 3]);
    }

    #[test]
    fn enable_masks_to_one_bit() {
        let mut hal = SimHal::new();
        let cfg = CfrEnable {
            engine: [true, false, true],
            bypass: [false, false, true],
        };
        Cfr::new(&mut hal).set_enable(TxChannels::TX0, &cfg).unwrap();
        let mut b = [0u8; 3];
        hal.mem().read(MAILBOX_SET, &mut b);
        assert_eq!(b, [0, 0, 1]);
        let subs: Vec<_> = hal.commands().iter().map(|c| c.ext[3]).collect();
        assert_eq!(subs, vec![0x84, 0x85]);
    }

    #[test]
    fn pulse_programming() {
        let mut hal = SimHal::new();
        hal.mem_mut().set_u32(ADDR_CFR_PULSE, 0x2004_0000);
        let p = pulse(4, 10);
        Cfr::new(&mut hal)
            .write_correction_pulse(TxChannels::TX1, &p)
            .unwrap();

        let addr = 0x2004_0000 + CFR_PULSE_RAM_STRIDE;
        let mut word = [0u8; 4];
        hal.mem().read(addr + 4, &mut word);
        // Second coefficient: re 11, conjugated im 12.
        assert_eq!(word, [11, 0, 12, 0]);

        let cmds = hal.commands();
        // Mode 1A goes to all eight channels, then pulse done to Tx1 only.
        assert_eq!(cmds.len(), 9);
        assert_eq!(cmds[7].ext[2], 0x80);
        assert_eq!(cmds[8].ext, [OBJID_TRACKING_CAL_CTRL, OBJID_CFR_INIT, 0x2, 0x81]);
        let mut done = [0u8; 3];
        hal.mem().read(MAILBOX_SET, &mut done);
        assert_eq!(done, [4, 0, 0]);

        assert!(Cfr::new(&mut hal)
            .write_correction_pulse(TxChannels::TX1, &pulse(513, 0))
            .is_err());
    }

    #[test]
    fn half_pulses_report_half_length() {
        let mut hal = SimHal::new();
        hal.mem_mut().set_u32(ADDR_CFR_PULSE, 0x2004_0000);
        let halves = [pulse(200, 0), pulse(200, 7)];
        Cfr::new(&mut hal)
            .write_correction_pulses(TxChannels::TX0, &halves)
            .unwrap();
        let mut done = [0u8; 3];
        hal.mem().read(MAILBOX_SET, &mut done);
        assert_eq!(done, [200, 0, 0]);
        // The second half lands right after the first.
        let mut word = [0u8; 2];
        hal.mem().read(0x2004_0000 + 200 * 4, &mut word);
        assert_eq!(i16::from_le_bytes(word), 7);

        assert!(Cfr::new(&mut hal)
            .write_correction_pulses(TxChannels::TX0, &[pulse(200, 0), pulse(100, 0)])
            .is_err());
        assert!(Cfr::new(&mut hal)
            .write_correction_pulses(TxChannels::TX0, &[])
            .is_err());
    }
}
