/*!

A device-core HAL for the ADRV904X and ADRV9025 families of RF transceivers.
It covers everything between a raw register interface and a running radio:
checking and loading firmware images, extracting the device profile, talking
to the on-chip co-processor, driving the DFE blocks (DPD, CFR, CLGC), managing
the radio sequencer, and taking diagnostic memory dumps.

The crate never touches a bus itself. All hardware access goes through the
[`Hal`] trait, which platform code implements over its SPI controller. The
[`sim::SimHal`] model implements it in memory, which is what the tests and
the examples below run against.

The entry point is [`Device`], which owns the HAL and every piece of runtime
state. Sub-APIs borrow it mutably for the length of an operation:

- [`Device::dpd`] - Digital pre-distortion.
- [`Device::cfr`] - Crest factor reduction.
- [`Device::clgc`] - Closed-loop gain control.
- [`Device::sequencer`] - Radio-sequencer load, start, stop and reload.

Every fallible call returns an [`Error`], and [`Error::recovery_action`] says
what it takes to get the device back to a known state.

A typical bring-up looks like this:

```no_run
use adrv_hal::{sim::SimHal, Device, DeviceState};

fn main() -> anyhow::Result<()> {
    let mut device = Device::new(SimHal::new());

    device.load_cpu_images("firmware/cpu_image.bin")?;
    device.load_stream_image("firmware/stream_image.bin")?;
    device.load_profile("firmware/profile.bin")?;
    device.load_rx_gain_table(0xFF, "firmware/rx_gain_table.csv")?;

    device.sequencer().load_image("firmware/radio_seq.bin")?;
    device.sequencer().start()?;
    device.sequencer().radio_start()?;
    assert!(device.state().contains(DeviceState::RS_LOADED));

    device.load_cfr_pulses_from_profile("firmware/profile.bin")?;
    let status = device.dpd().status(0)?;
    println!("DPD on Tx0: {status:?}");

    // Later, swap the sequencer image without tearing the radio down.
    device.sequencer().reload("firmware/radio_seq_v2.bin")?;
    Ok(())
}
```

*/

#![warn(missing_docs)]

mod flags;

pub mod codec;
pub mod consts;
pub mod dfe;
mod error;
pub mod hal;
pub mod mailbox;
pub mod memdump;
pub mod poll;
pub mod profile;
pub mod sequencer;
pub mod sim;
pub mod validate;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::consts::*;
use crate::dfe::cfr::{Cfr, CorrectionPulse};
use crate::dfe::clgc::Clgc;
use crate::dfe::dpd::Dpd;
use crate::dfe::TxChannels;
use crate::error::keep_first;
use crate::flags::bit_flags;
use crate::hal::{write_chunked, StreamingGuard};
use crate::memdump::{MemDump, MemDumpConfig};
use crate::profile::{InitExtract, ProfileReader};
use crate::sequencer::{RsContext, Sequencer, SequencerState};
use crate::validate::{check_stream_image, CpuArchive, GainTable};

pub use crate::error::{Error, RecoveryAction};
pub use crate::hal::Hal;

bit_flags! {
    /// What has been loaded into the device so far.
    pub struct DeviceState: u8 {
        /// CPU 0 firmware is loaded.
        const CPU0_LOADED = 0x01;
        /// CPU 1 firmware is loaded.
        const CPU1_LOADED = 0x02;
        /// The stream processor image is loaded.
        const STREAM_LOADED = 0x04;
        /// A device profile has been extracted.
        const PROFILE_LOADED = 0x08;
        /// A radio-sequencer image is loaded.
        const RS_LOADED = 0x10;
        /// At least one Rx gain table is loaded.
        const GAIN_TABLE_LOADED = 0x20;
    }
}

bit_flags! {
    /// A set of Rx channels.
    pub struct RxChannels: u8 {
        /// Rx channel 0.
        const RX0 = 0x01;
        /// Rx channel 1.
        const RX1 = 0x02;
        /// Rx channel 2.
        const RX2 = 0x04;
        /// Rx channel 3.
        const RX3 = 0x08;
        /// Rx channel 4.
        const RX4 = 0x10;
        /// Rx channel 5.
        const RX5 = 0x20;
        /// Rx channel 6.
        const RX6 = 0x40;
        /// Rx channel 7.
        const RX7 = 0x80;
    }
}

/// Device-level settings that don't come from the profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Tx channels brought up by initialization. CFR pulses are only
    /// programmed on these, and the others get their clocks enabled for
    /// memory dumps.
    pub initialized_tx: TxChannels,
    /// Chunk size for CPU and stream image loads.
    pub image_chunk_size: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            initialized_tx: TxChannels::all(),
            image_chunk_size: IMAGE_LOAD_CHUNK_SIZE,
        }
    }
}

/// Lowest and highest gain index loaded into one Rx channel's gain table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GainRange {
    /// Lowest index.
    pub min: u8,
    /// Highest index.
    pub max: u8,
}

/// A transceiver, together with everything the driver knows about it.
///
/// There is no global state; two `Device`s on two HALs are fully
/// independent.
pub struct Device<H: Hal> {
    hal: H,
    config: DeviceConfig,
    state: DeviceState,
    init: Option<InitExtract>,
    rs: RsContext,
    gain: [Option<GainRange>; NUM_RX_CHANNELS],
}

impl<H: Hal> std::fmt::Debug for Device<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("rs", &self.rs)
            .field("gain", &self.gain)
            .finish_non_exhaustive()
    }
}

impl<H: Hal> Device<H> {
    /// Wrap a HAL with the default configuration.
    pub fn new(hal: H) -> Self {
        Self::with_config(hal, DeviceConfig::default())
    }

    /// Wrap a HAL.
    pub fn with_config(hal: H, config: DeviceConfig) -> Self {
        Self {
            hal,
            config,
            state: DeviceState::empty(),
            init: None,
            rs: RsContext::default(),
            gain: [None; NUM_RX_CHANNELS],
        }
    }

    /// The underlying HAL.
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// The underlying HAL, mutably. Register traffic sent this way is not
    /// tracked by the device state.
    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// Give back the HAL.
    pub fn into_inner(self) -> H {
        self.hal
    }

    /// Device configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// What has been loaded so far.
    pub fn state(&self) -> DeviceState {
        let mut s = self.state;
        if self.rs.state != SequencerState::Unloaded {
            s.insert(DeviceState::RS_LOADED);
        }
        s
    }

    /// The configuration extracted from the last loaded profile.
    pub fn init_extract(&self) -> Option<&InitExtract> {
        self.init.as_ref()
    }

    /// Gain-table range loaded into Rx channel `rx`.
    pub fn gain_range(&self, rx: usize) -> Option<GainRange> {
        self.gain.get(rx).copied().flatten()
    }

    /// DPD operations.
    pub fn dpd(&mut self) -> Dpd<'_, H> {
        Dpd::new(&mut self.hal)
    }

    /// CFR operations.
    pub fn cfr(&mut self) -> Cfr<'_, H> {
        Cfr::new(&mut self.hal)
    }

    /// CLGC operations.
    pub fn clgc(&mut self) -> Clgc<'_, H> {
        Clgc::new(&mut self.hal)
    }

    /// Radio-sequencer operations.
    pub fn sequencer(&mut self) -> Sequencer<'_, H> {
        Sequencer::new(&mut self.hal, &mut self.rs)
    }

    fn write_streamed(&mut self, addr: u32, data: &[u8], chunk: usize) -> Result<(), Error> {
        let mut stream = StreamingGuard::enter(&mut self.hal)?;
        let r = write_chunked(&mut *stream, addr, data, chunk, None::<fn(usize, usize)>);
        keep_first(r, stream.finish())
    }

    /// Load both main-CPU firmware images from an archive file.
    pub fn load_cpu_images<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        let data = std::fs::read(path)?;
        self.load_cpu_images_bytes(&data)
    }

    /// Load both main-CPU firmware images from an archive in memory.
    ///
    /// The archive is fully checked before anything is written.
    ///
    /// # Errors
    ///
    /// The errors of [`CpuArchive::parse`] for a bad archive. A failure to
    /// leave SPI streaming mode is [`Error::Interface`].
    pub fn load_cpu_images_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        let archive = CpuArchive::parse(data)?;
        let chunk = self.config.image_chunk_size;
        let mut stream = StreamingGuard::enter(&mut self.hal)?;
        let no_progress = None::<fn(usize, usize)>;
        let r = write_chunked(&mut *stream, CPU0_PROGRAM_ADDR, archive.cpu0, chunk, no_progress)
            .and_then(|()| {
                write_chunked(&mut *stream, CPU1_PROGRAM_ADDR, archive.cpu1, chunk, no_progress)
            });
        keep_first(r, stream.finish())?;
        self.state.insert(DeviceState::CPU0_LOADED | DeviceState::CPU1_LOADED);
        info!("CPU images loaded");
        Ok(())
    }

    /// Load the stream-processor image from a file.
    pub fn load_stream_image<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        let data = std::fs::read(path)?;
        self.load_stream_image_bytes(&data)
    }

    /// Load the stream-processor image from memory.
    pub fn load_stream_image_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        check_stream_image(data)?;
        self.write_streamed(STREAM_IMAGE_ADDR, data, self.config.image_chunk_size)?;
        self.state.insert(DeviceState::STREAM_LOADED);
        info!("stream image loaded, {} bytes", data.len());
        Ok(())
    }

    /// Extract the device profile from a file.
    pub fn load_profile<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        let file = BufReader::new(File::open(path)?);
        self.load_profile_from(file)
    }

    /// Extract the device profile from any seekable source.
    ///
    /// The extracted configuration replaces the previous one only if the
    /// whole extraction succeeds. The profile's radio-sequencer enable is
    /// applied to the sequencer.
    pub fn load_profile_from<R: Read + Seek>(&mut self, source: R) -> Result<(), Error> {
        let mut reader = ProfileReader::new(source)?;
        let init = profile::extract(&mut reader)?;
        self.rs.radio_seq_en = init.rs.radio_seq_en;
        debug!(
            "profile: tx mask 0x{:02x}, rx mask 0x{:03x}, sequencer {}",
            init.tx_channel_mask,
            init.rx_channel_mask,
            if init.rs.radio_seq_en { "enabled" } else { "disabled" }
        );
        self.init = Some(init);
        self.state.insert(DeviceState::PROFILE_LOADED);
        Ok(())
    }

    /// Load an Rx gain table from a CSV file into every channel in `rx_mask`.
    pub fn load_rx_gain_table<P: AsRef<Path>>(
        &mut self,
        rx_mask: u8,
        path: P,
    ) -> Result<(), Error> {
        let text = std::fs::read_to_string(path)?;
        self.load_rx_gain_table_str(RxChannels::from_bits_truncate(rx_mask), &text)
    }

    /// Load an Rx gain table from CSV text into every channel in `channels`.
    ///
    /// Each row goes to its gain index in the channel's table, so the table
    /// occupies `min_index..=max_index`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] for an empty channel set, otherwise the
    /// errors of [`GainTable::parse`] or the register interface.
    pub fn load_rx_gain_table_str(
        &mut self,
        channels: RxChannels,
        text: &str,
    ) -> Result<(), Error> {
        if channels.is_empty() {
            return Err(Error::InvalidParameter("no Rx channel selected"));
        }
        let table = GainTable::parse(text)?;
        let mut entries = Vec::with_capacity(table.rows.len() * RX_GAIN_TABLE_ENTRY_SIZE as usize);
        for row in &table.rows {
            let p = row.phase_offset.to_le_bytes();
            let d = row.dig_gain.to_le_bytes();
            entries.extend_from_slice(&[
                row.fe_control,
                row.ext_control,
                p[0],
                p[1],
                d[0],
                d[1],
                0,
                0,
            ]);
        }
        let range = GainRange {
            min: table.min_index(),
            max: table.max_index(),
        };
        for rx in 0..NUM_RX_CHANNELS {
            if channels.bits() & (1 << rx) == 0 {
                continue;
            }
            let addr = RX_GAIN_TABLE_BASE
                + rx as u32 * RX_GAIN_TABLE_STRIDE
                + u32::from(range.min) * RX_GAIN_TABLE_ENTRY_SIZE;
            self.write_streamed(addr, &entries, IMAGE_LOAD_CHUNK_SIZE)?;
            self.gain[rx] = Some(range);
            debug!(
                "Rx{rx} gain table: indices {}..={}, crc 0x{:08x}",
                range.min,
                range.max,
                table.checksum()
            );
        }
        self.state.insert(DeviceState::GAIN_TABLE_LOADED);
        Ok(())
    }

    /// Program the CFR correction pulses stored in a profile file.
    pub fn load_cfr_pulses_from_profile<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        let file = BufReader::new(File::open(path)?);
        self.load_cfr_pulses_from(file)
    }

    /// Program the CFR correction pulses stored in a profile.
    ///
    /// Only initialized Tx channels are programmed. Pulses with no
    /// coefficients are skipped; if both of a channel's pulses are present
    /// they are written as a pair of half pulses. The channel's CFR
    /// interpolation is taken from its first non-empty pulse.
    pub fn load_cfr_pulses_from<R: Read + Seek>(&mut self, source: R) -> Result<(), Error> {
        let mut reader = ProfileReader::new(source)?;
        let initialized = u32::from(self.config.initialized_tx.bits());
        let all = profile::extract_cfr_pulses(&mut reader, initialized)?;
        for (tx, pulses) in all.into_iter().enumerate() {
            let Some(p) = pulses else { continue };
            let list: Vec<CorrectionPulse> = p
                .pulses
                .iter()
                .cloned()
                .filter(|c| !c.is_empty())
                .map(CorrectionPulse::new)
                .collect();
            if list.is_empty() {
                continue;
            }
            debug!(
                "Tx{tx}: {} CFR pulse(s) from profile, interpolation {:?}",
                list.len(),
                p.interpolation
            );
            let interpolation = if p.pulses[0].is_empty() {
                p.interpolation[1]
            } else {
                p.interpolation[0]
            };
            let mask = TxChannels::single(tx)?;
            let mut cfr = self.cfr();
            cfr.set_interpolation(mask, interpolation)?;
            cfr.write_correction_pulses(mask, &list)?;
        }
        Ok(())
    }

    fn driver_state(&self) -> Vec<u8> {
        format!("{self:#?}\nprofile: {:#?}\n", self.init).into_bytes()
    }

    /// Write a memory dump to `out`, returning the number of bytes written.
    ///
    /// If `cfg` carries no driver state, the device's own state is recorded.
    /// See [`memdump`] for the format.
    pub fn mem_dump<W: Write + ?Sized>(
        &mut self,
        out: &mut W,
        cfg: &MemDumpConfig,
    ) -> Result<u64, Error> {
        let owned;
        let cfg = if cfg.driver_state.is_none() {
            owned = MemDumpConfig {
                driver_state: Some(self.driver_state()),
                ..cfg.clone()
            };
            &owned
        } else {
            cfg
        };
        MemDump::new(&mut self.hal)
            .initialized_tx(self.config.initialized_tx)
            .write(out, cfg)
    }

    /// Write a memory dump to a new file at `path`, returning the number of
    /// bytes written.
    pub fn mem_dump_to_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        cfg: &MemDumpConfig,
    ) -> Result<u64, Error> {
        let mut out = BufWriter::new(File::create(path)?);
        let n = self.mem_dump(&mut out, cfg)?;
        out.flush()?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Op, SimHal};
    use crate::validate::cpu_archive_header;

    fn archive() -> Vec<u8> {
        let mut data = cpu_archive_header(CPU_ARCHIVE_MAGIC, CPU_ARCHIVE_FORMAT_REV).to_vec();
        data.resize(CpuArchive::FILE_SIZE, 0);
        data[CPU_ARCHIVE_HEADER_SIZE] = 0xC0;
        data[CPU_ARCHIVE_HEADER_SIZE + CPU0_IMAGE_SIZE] = 0xC1;
        data
    }

    #[test]
    fn cpu_images() {
        let mut device = Device::new(SimHal::new());
        device.load_cpu_images_bytes(&archive()).unwrap();
        assert!(device
            .state()
            .contains(DeviceState::CPU0_LOADED | DeviceState::CPU1_LOADED));
        let hal = device.hal();
        assert_eq!(hal.mem().u8(CPU0_PROGRAM_ADDR), 0xC0);
        assert_eq!(hal.mem().u8(CPU1_PROGRAM_ADDR), 0xC1);
        assert!(!hal.is_streaming());
    }

    #[test]
    fn streaming_exit_failure() {
        let mut hal = SimHal::new();
        hal.fail_streaming_exit(true);
        let mut device = Device::new(hal);
        let e = device.load_stream_image_bytes(&[0; 64]).unwrap_err();
        assert_eq!(e.recovery_action(), RecoveryAction::ResetInterface);
        assert!(!device.state().contains(DeviceState::STREAM_LOADED));
    }

    #[test]
    fn write_failure_beats_streaming_failure() {
        let mut hal = SimHal::new();
        hal.fail_streaming_exit(true);
        hal.fail_writes_at(Some(STREAM_IMAGE_ADDR + 8));
        let mut device = Device::new(hal);
        let e = device.load_stream_image_bytes(&[0; 64]).unwrap_err();
        assert!(matches!(e, Error::Interface("simulated write failure")));
        // Streaming mode was still turned off exactly once.
        let exits = device
            .hal()
            .ops()
            .iter()
            .filter(|op| **op == Op::Streaming(false))
            .count();
        assert_eq!(exits, 1);
    }

    #[test]
    fn gain_table_rows_land_at_their_index() {
        let csv = "\"Version\",1,0,0,0\n\
                   \"Checksum\",0,0,0,0\n\
                   Gain Index,FE Control Word,Ext Control,Phase Offset,Digital Gain\n\
                   195,1,0,0,-2\n\
                   196,2,0,256,0\n";
        let mut device = Device::new(SimHal::new());
        device
            .load_rx_gain_table_str(RxChannels::RX1 | RxChannels::RX5, csv)
            .unwrap();
        assert_eq!(device.gain_range(5), Some(GainRange { min: 195, max: 196 }));
        assert_eq!(device.gain_range(0), None);
        let base = RX_GAIN_TABLE_BASE + RX_GAIN_TABLE_STRIDE + 196 * RX_GAIN_TABLE_ENTRY_SIZE;
        let mut entry = [0u8; 8];
        device.hal().mem().read(base, &mut entry);
        assert_eq!(entry, [2, 0, 0, 1, 0, 0, 0, 0]);
        assert!(device
            .load_rx_gain_table_str(RxChannels::empty(), csv)
            .is_err());
    }

    #[test]
    fn dump_records_device_state() {
        let mut device = Device::new(SimHal::new());
        let cfg = MemDumpConfig {
            cpu_ram: vec![],
            telemetry: vec![],
            registers: vec![],
            dfe_ram: vec![],
            ..MemDumpConfig::default()
        };
        let mut out = Vec::new();
        let n = device.mem_dump(&mut out, &cfg).unwrap();
        assert_eq!(n, out.len() as u64);
        let dump = memdump::parse(&out).unwrap();
        let state = String::from_utf8_lossy(&dump.records[0].payload[24..]).into_owned();
        assert!(state.contains("Device"));
    }
}
