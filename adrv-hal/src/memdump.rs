/*!
Memory and diagnostic dumps.

A dump is a snapshot of the device for post-mortem analysis: driver state,
firmware versions, trace buffers, CPU memories, telemetry, and register
windows. It is written as a binary container:

```text
file header   24 bytes: version, product id, revision, timestamp, CRC32, pad
record        type u32, length u32, payload[length], pad to 8, CRC32, 4 zero bytes
record        ...
```

Every multi-byte value is little-endian. Each record's CRC covers only its
payload, so a damaged record doesn't take the rest of the file with it.
[`parse`] reads a dump back and checks every CRC.

```
use adrv_hal::memdump::{self, MemDumpConfig, RecordType};
use adrv_hal::{sim::SimHal, Device};

# fn main() -> Result<(), adrv_hal::Error> {
let mut device = Device::new(SimHal::new());
let cfg = MemDumpConfig {
    cpu_ram: vec![(0x0100_0000, 0x0100_00FF)],
    telemetry: vec![],
    registers: vec![],
    dfe_ram: vec![],
    ..MemDumpConfig::default()
};
let mut file = Vec::new();
device.mem_dump(&mut file, &cfg)?;

let dump = memdump::parse(&file)?;
assert!(dump.records.iter().any(|r| r.kind == RecordType::CpuRam));
# Ok(())
# }
```

Reading device memory has side effects in two windows. Registers in the
SPI-only window can't be bulk-read, so they are read one byte at a time. The
hardware semaphores clear themselves when read, so every chunk read from the
semaphore window is written straight back.
*/

use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::time::{SystemTime, UNIX_EPOCH};

use bytemuck::Zeroable;
use tracing::{debug, info, trace, warn};

use crate::codec::{ByteReader, ByteWriter};
use crate::consts::*;
use crate::dfe::TxChannels;
use crate::error::keep_first;
use crate::hal::Hal;
use crate::poll;
use crate::validate::{crc32, Crc32};
use crate::Error;

/// Container format version written to the file header.
pub const DUMP_FORMAT_VERSION: u16 = 1;

/// Size of the file header.
pub const FILE_HEADER_SIZE: usize = 24;

const TRACE_FORMAT_CORESIGHT: u16 = 1;
const LITTLE_ENDIAN: u8 = 0;

const fn parse_version(s: &str) -> u16 {
    let b = s.as_bytes();
    let mut i = 0;
    let mut v = 0u16;
    while i < b.len() {
        v = v * 10 + (b[i] - b'0') as u16;
        i += 1;
    }
    v
}

const DRIVER_VERSION: [u16; 3] = [
    parse_version(env!("CARGO_PKG_VERSION_MAJOR")),
    parse_version(env!("CARGO_PKG_VERSION_MINOR")),
    parse_version(env!("CARGO_PKG_VERSION_PATCH")),
];

/// Kind of a dump record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecordType {
    /// Firmware version of one processor.
    FirmwareVersion = 1,
    /// A telemetry buffer.
    Telemetry = 2,
    /// ETM trace descriptors and trace buffer.
    EtmTrace = 3,
    /// Opaque driver state.
    DriverState = 4,
    /// A CPU memory region.
    CpuRam = 5,
    /// A register window.
    Register = 6,
}

impl RecordType {
    /// Decode a raw record type.
    pub fn from_raw(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::FirmwareVersion,
            2 => Self::Telemetry,
            3 => Self::EtmTrace,
            4 => Self::DriverState,
            5 => Self::CpuRam,
            6 => Self::Register,
            _ => return None,
        })
    }
}

/// Processor owning a memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CpuType {
    /// The stream processor.
    Stream = 1,
    /// One of the main Cortex-M class CPUs.
    ArmV7 = 2,
    /// The DFE Cortex-A class processor.
    ArmV8 = 3,
}

impl CpuType {
    /// Decode a raw CPU type.
    pub fn from_raw(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::Stream,
            2 => Self::ArmV7,
            3 => Self::ArmV8,
            _ => return None,
        })
    }

    fn for_address(addr: u32) -> Self {
        if addr >= STREAM_CPU_RAM_ADDR {
            Self::Stream
        } else {
            Self::ArmV7
        }
    }
}

/// Wall-clock time stamped into a dump, in UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DumpTime {
    /// Calendar year.
    pub year: u16,
    /// Month, `1..=12`.
    pub month: u8,
    /// Day of the month, `1..=31`.
    pub day: u8,
    /// Hour, `0..=23`.
    pub hour: u8,
    /// Minute, `0..=59`.
    pub minute: u8,
    /// Second, `0..=59`.
    pub second: u8,
}

impl DumpTime {
    /// Convert seconds since the Unix epoch.
    pub fn from_unix(secs: u64) -> Self {
        let days = (secs / 86_400) as i64;
        let rem = secs % 86_400;
        // Days-to-civil conversion over 400-year eras.
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z.rem_euclid(146_097);
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
        let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
        let year = (yoe + era * 400 + i64::from(month <= 2)) as u16;
        Self {
            year,
            month,
            day,
            hour: (rem / 3600) as u8,
            minute: (rem / 60 % 60) as u8,
            second: (rem % 60) as u8,
        }
    }

    /// The current time.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::from_unix(secs)
    }
}

/// What goes into a dump.
///
/// Regions are inclusive `(start, end)` address pairs. A region starting at
/// address 0 is skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemDumpConfig {
    /// Force every processor into its exception handler first, so memory is
    /// captured from a stopped system. This halts the firmware.
    pub force_exception: bool,
    /// Time stamped into the file header.
    pub timestamp: DumpTime,
    /// Main and stream CPU memories.
    pub cpu_ram: Vec<(u32, u32)>,
    /// Telemetry buffers.
    pub telemetry: Vec<(u32, u32)>,
    /// Register windows.
    pub registers: Vec<(u32, u32)>,
    /// DFE processor memories.
    pub dfe_ram: Vec<(u32, u32)>,
    /// Driver state to record. `None` lets [`Device::mem_dump`] fill in its
    /// own state.
    ///
    /// [`Device::mem_dump`]: crate::Device::mem_dump
    pub driver_state: Option<Vec<u8>>,
}

impl Default for MemDumpConfig {
    fn default() -> Self {
        Self {
            force_exception: false,
            timestamp: DumpTime::now(),
            cpu_ram: DUMP_CPU_RAM_REGIONS.to_vec(),
            telemetry: DUMP_TELEM_REGIONS.to_vec(),
            registers: DUMP_REG_REGIONS.to_vec(),
            dfe_ram: DUMP_DFE_RAM_REGIONS.to_vec(),
            driver_state: None,
        }
    }
}

/// Dump file header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct FileHeader {
    /// Container format version.
    pub version: u16,
    /// Device product ID.
    pub product_id: u16,
    /// Silicon revision.
    pub revision: u16,
    /// Calendar year of the dump.
    pub year: u16,
    /// Month of the dump.
    pub month: u8,
    /// Day of the dump.
    pub day: u8,
    /// Hour of the dump.
    pub hour: u8,
    /// Minute of the dump.
    pub minute: u8,
    /// Second of the dump.
    pub second: u8,
    pad: [u8; 3],
    /// CRC32 of the preceding 16 bytes.
    pub crc: u32,
    pad2: u32,
}

impl FileHeader {
    fn new(product_id: u16, revision: u16, t: DumpTime) -> Self {
        Self {
            version: DUMP_FORMAT_VERSION,
            product_id,
            revision,
            year: t.year,
            month: t.month,
            day: t.day,
            hour: t.hour,
            minute: t.minute,
            second: t.second,
            ..Self::zeroed()
        }
    }

    /// Swap between host order and the file's little-endian order.
    fn le_convert(&mut self) {
        self.version = self.version.to_le();
        self.product_id = self.product_id.to_le();
        self.revision = self.revision.to_le();
        self.year = self.year.to_le();
        self.crc = self.crc.to_le();
    }

    /// The timestamp.
    pub fn time(&self) -> DumpTime {
        DumpTime {
            year: self.year,
            month: self.month,
            day: self.day,
            hour: self.hour,
            minute: self.minute,
            second: self.second,
        }
    }

    fn encode(mut self) -> [u8; FILE_HEADER_SIZE] {
        self.crc = 0;
        self.le_convert();
        self.crc = crc32(&bytemuck::bytes_of(&self)[..16]).to_le();
        let mut out = [0u8; FILE_HEADER_SIZE];
        out.copy_from_slice(bytemuck::bytes_of(&self));
        out
    }
}

fn record_padding(len: u32) -> usize {
    (8 - (len % 8) as usize) % 8
}

/// Output file that keeps count of what went in.
struct DumpWriter<'w, W: Write + ?Sized> {
    out: &'w mut W,
    total: u64,
}

impl<'w, W: Write + ?Sized> DumpWriter<'w, W> {
    fn raw(&mut self, b: &[u8]) -> Result<(), Error> {
        self.out.write_all(b)?;
        self.total += b.len() as u64;
        Ok(())
    }

    fn record(&mut self, kind: RecordType, len: u32) -> Result<RecordSink<'_, 'w, W>, Error> {
        trace!("dump record {kind:?}, {len} bytes");
        let mut hdr = [0u8; 8];
        hdr[..4].copy_from_slice(&(kind as u32).to_le_bytes());
        hdr[4..].copy_from_slice(&len.to_le_bytes());
        self.raw(&hdr)?;
        Ok(RecordSink {
            w: self,
            crc: Crc32::new(),
            len,
            written: 0,
        })
    }
}

/// One record being written. The CRC runs over everything put in.
struct RecordSink<'a, 'w, W: Write + ?Sized> {
    w: &'a mut DumpWriter<'w, W>,
    crc: Crc32,
    len: u32,
    written: u32,
}

impl<W: Write + ?Sized> RecordSink<'_, '_, W> {
    fn put(&mut self, b: &[u8]) -> Result<(), Error> {
        self.w.raw(b)?;
        self.crc.update(b);
        self.written += b.len() as u32;
        Ok(())
    }

    fn close(self) -> Result<(), Error> {
        if self.written != self.len {
            warn!(
                "dump record declared {} bytes but {} were written",
                self.len, self.written
            );
            return Err(Error::State("dump record length mismatch"));
        }
        let pad = record_padding(self.len);
        let mut trailer = [0u8; 16];
        trailer[pad..pad + 4].copy_from_slice(&self.crc.finish().to_le_bytes());
        self.w.raw(&trailer[..pad + 8])
    }
}

/// Enables the Tx slice clocks of uninitialized channels for the length of
/// a dump, so their memories are readable, and restores the register after.
struct SliceClocks<'a, H: Hal + ?Sized> {
    hal: &'a mut H,
    saved: Option<u8>,
}

impl<'a, H: Hal + ?Sized> SliceClocks<'a, H> {
    fn enable(hal: &'a mut H, channels: TxChannels) -> Result<Self, Error> {
        if channels.is_empty() {
            return Ok(Self { hal, saved: None });
        }
        let saved = hal.read_u8(REG_TX_SLICE_CLK_EN)?;
        hal.write_u8(REG_TX_SLICE_CLK_EN, saved | channels.bits())?;
        debug!("Tx slice clocks enabled for {channels:?}");
        Ok(Self {
            hal,
            saved: Some(saved),
        })
    }

    fn finish(mut self) -> Result<(), Error> {
        self.restore()
    }

    fn restore(&mut self) -> Result<(), Error> {
        match self.saved.take() {
            Some(v) => self.hal.write_u8(REG_TX_SLICE_CLK_EN, v),
            None => Ok(()),
        }
    }
}

impl<H: Hal + ?Sized> Deref for SliceClocks<'_, H> {
    type Target = H;
    fn deref(&self) -> &H {
        self.hal
    }
}

impl<H: Hal + ?Sized> DerefMut for SliceClocks<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        self.hal
    }
}

impl<H: Hal + ?Sized> Drop for SliceClocks<'_, H> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!("failed to restore Tx slice clocks: {e}");
        }
    }
}

fn in_window(addr: u32, base: u32, size: u32) -> bool {
    addr >= base && u64::from(addr) < u64::from(base) + u64::from(size)
}

fn region_len(start: u32, end: u32) -> Result<u32, Error> {
    if end < start {
        return Err(Error::AddressRange {
            range: start..u32::MAX,
            addr: end,
        });
    }
    (end - start)
        .checked_add(1)
        .ok_or(Error::InvalidParameter("dump region too large"))
}

/// Read `[start, end]` into the record in chunks.
fn dump_region<H, W>(
    hal: &mut H,
    sink: &mut RecordSink<'_, '_, W>,
    start: u32,
    end: u32,
) -> Result<(), Error>
where
    H: Hal + ?Sized,
    W: Write + ?Sized,
{
    let len = u64::from(end - start) + 1;
    let mut buf = [0u8; MEM_DUMP_CHUNK_SIZE];
    let mut done = 0u64;
    while done < len {
        let n = (len - done).min(MEM_DUMP_CHUNK_SIZE as u64) as usize;
        let addr = start + done as u32;
        let chunk = &mut buf[..n];
        if in_window(addr, SPI_ONLY_REGS_ADDR, SPI_ONLY_REGS_SIZE) {
            for (i, b) in chunk.iter_mut().enumerate() {
                *b = hal.read_u8(addr + i as u32)?;
            }
        } else {
            hal.read_bytes(addr, chunk)?;
            let last = u64::from(addr) + n as u64;
            if addr >= HW_SEMAPHORE_ADDR
                && last <= u64::from(HW_SEMAPHORE_ADDR) + u64::from(HW_SEMAPHORE_SIZE)
            {
                hal.write_bytes(addr, chunk)?;
            }
        }
        sink.put(chunk)?;
        done += n as u64;
    }
    Ok(())
}

/// Writes memory dumps. Get one with
/// [`Device::mem_dump`][crate::Device::mem_dump], or build one on a bare HAL.
pub struct MemDump<'a, H: Hal + ?Sized> {
    hal: &'a mut H,
    initialized_tx: TxChannels,
}

impl<'a, H: Hal + ?Sized> MemDump<'a, H> {
    /// A dump of the device behind `hal`, treating every Tx channel as
    /// initialized.
    pub fn new(hal: &'a mut H) -> Self {
        Self {
            hal,
            initialized_tx: TxChannels::all(),
        }
    }

    /// Set which Tx channels are initialized. The others have their slice
    /// clocks enabled for the dump.
    pub fn initialized_tx(mut self, channels: TxChannels) -> Self {
        self.initialized_tx = channels;
        self
    }

    /// Write the dump to `out`, returning the number of bytes written.
    ///
    /// Regions are checked before anything happens to the device. If both the
    /// dump and restoring the slice clocks fail, the dump's error is returned.
    ///
    /// # Errors
    ///
    /// [`Error::AddressRange`] for a region that ends before it starts,
    /// [`Error::Timeout`] if a processor doesn't take the forced exception,
    /// [`Error::Io`] if writing fails, or any register access error.
    pub fn write<W: Write + ?Sized>(self, out: &mut W, cfg: &MemDumpConfig) -> Result<u64, Error> {
        for (start, end) in cfg
            .cpu_ram
            .iter()
            .chain(&cfg.telemetry)
            .chain(&cfg.registers)
            .chain(&cfg.dfe_ram)
        {
            if *start != 0 {
                region_len(*start, *end)?;
            }
        }
        if cfg.force_exception {
            force_exception(&mut *self.hal)?;
        }
        let uninit = TxChannels::from_bits_truncate(!self.initialized_tx.bits());
        let mut clocks = SliceClocks::enable(self.hal, uninit)?;
        let mut w = DumpWriter { out, total: 0 };
        let r = write_body(&mut *clocks, &mut w, cfg);
        let total = keep_first(r, clocks.finish()).map(|()| w.total)?;
        info!("memory dump complete, {total} bytes");
        Ok(total)
    }
}

fn force_exception<H: Hal + ?Sized>(hal: &mut H) -> Result<(), Error> {
    info!("forcing processor exceptions for memory dump");
    hal.write_u8(REG_CPU_FORCE_EXCEPTION, CPU_FORCE_EXCEPTION_CMD)?;
    for reg in [REG_CPU0_EXCEPTION, REG_CPU1_EXCEPTION] {
        poll::CPU_EXCEPTION.poll(&mut *hal, "CPU exception", |h| {
            Ok((h.read_u32(reg)? != 0).then_some(()))
        })?;
    }
    poll::DFE_EXCEPTION.poll(hal, "DFE exception handler", |h| {
        Ok((h.read_u8(REG_DFE_BOOT_STATUS)? == DFE_BOOT_STATUS_EXCEPTION_DONE).then_some(()))
    })
}

fn write_body<H, W>(
    hal: &mut H,
    w: &mut DumpWriter<'_, W>,
    cfg: &MemDumpConfig,
) -> Result<(), Error>
where
    H: Hal + ?Sized,
    W: Write + ?Sized,
{
    let product_id = hal.read_u8(REG_PRODUCT_ID)?;
    let revision = hal.read_u8(REG_SILICON_REV)?;
    w.raw(&FileHeader::new(product_id.into(), revision.into(), cfg.timestamp).encode())?;

    // Driver state.
    let state = cfg.driver_state.as_deref().unwrap_or(&[]);
    let mut hdr = ByteWriter::with_capacity(24);
    hdr.u16(0)
        .u16(0)
        .u32(state.len() as u32)
        .u16(DRIVER_VERSION[0])
        .u16(DRIVER_VERSION[1])
        .u16(DRIVER_VERSION[2])
        .zeros(2)
        .u32(0)
        .u8(LITTLE_ENDIAN)
        .zeros(3);
    let mut rec = w.record(RecordType::DriverState, (hdr.len() + state.len()) as u32)?;
    rec.put(hdr.as_slice())?;
    for chunk in state.chunks(MEM_DUMP_CHUNK_SIZE) {
        rec.put(chunk)?;
    }
    rec.close()?;

    // Firmware versions: radio, DFE, stream.
    for (id, addr) in FW_VERSION_ADDR.iter().enumerate() {
        let mut raw = [0u8; FW_VERSION_SIZE];
        hal.read_bytes(*addr, &mut raw)?;
        let mut r = ByteReader::new(&raw);
        let (major, minor, patch) = (r.u16()?, r.u16()?, r.u16()?);
        r.seek(8)?;
        let build = r.u32()?;
        let mut v = ByteWriter::with_capacity(16);
        v.u16(major)
            .u16(minor)
            .u16(patch)
            .zeros(2)
            .u32(build)
            .u32(id as u32);
        let mut rec = w.record(RecordType::FirmwareVersion, v.len() as u32)?;
        rec.put(v.as_slice())?;
        rec.close()?;
    }

    // ETM trace, only if some trace unit is running.
    let mut etm_on = Vec::new();
    for (i, reg) in ETM_ENABLE_REGS.iter().enumerate() {
        if hal.read_u32(*reg)? & ETM_ENABLE_BIT != 0 {
            etm_on.push(i as u16);
        }
    }
    if etm_on.is_empty() {
        debug!("no ETM enabled, skipping trace record");
    } else {
        let mut desc = ByteWriter::with_capacity(8 + 8 * etm_on.len() + 4);
        desc.u32(8 * etm_on.len() as u32)
            .u16(TRACE_FORMAT_CORESIGHT)
            .u8(etm_on.len() as u8)
            .u8(LITTLE_ENDIAN);
        for unit in &etm_on {
            desc.u16(CpuType::ArmV8 as u16)
                .u16(*unit)
                .u16(0)
                .u8(0)
                .u8(LITTLE_ENDIAN);
        }
        desc.u32(ETM_TRACE_BUFFER_SIZE);
        let mut rec = w.record(RecordType::EtmTrace, desc.len() as u32 + ETM_TRACE_BUFFER_SIZE)?;
        rec.put(desc.as_slice())?;
        dump_region(
            hal,
            &mut rec,
            ETM_TRACE_BUFFER_ADDR,
            ETM_TRACE_BUFFER_ADDR + ETM_TRACE_BUFFER_SIZE - 1,
        )?;
        rec.close()?;
    }

    for (id, (start, end)) in cfg.cpu_ram.iter().enumerate() {
        let cpu = CpuType::for_address(*start);
        region_record(hal, w, RecordType::CpuRam, id as u16, cpu, *start, *end)?;
    }
    for (id, (start, end)) in cfg.telemetry.iter().enumerate() {
        region_record(hal, w, RecordType::Telemetry, id as u16, CpuType::ArmV7, *start, *end)?;
    }
    for (id, (start, end)) in cfg.registers.iter().enumerate() {
        region_record(hal, w, RecordType::Register, id as u16, CpuType::ArmV7, *start, *end)?;
    }
    let first_dfe = cfg.cpu_ram.len();
    for (id, (start, end)) in cfg.dfe_ram.iter().enumerate() {
        let id = (first_dfe + id) as u16;
        region_record(hal, w, RecordType::CpuRam, id, CpuType::ArmV8, *start, *end)?;
    }
    Ok(())
}

fn region_record<H, W>(
    hal: &mut H,
    w: &mut DumpWriter<'_, W>,
    kind: RecordType,
    id: u16,
    cpu: CpuType,
    start: u32,
    end: u32,
) -> Result<(), Error>
where
    H: Hal + ?Sized,
    W: Write + ?Sized,
{
    if start == 0 {
        return Ok(());
    }
    let len = region_len(start, end)?;
    let mut hdr = ByteWriter::with_capacity(24);
    hdr.u64(start.into()).u32(len);
    if kind == RecordType::Register {
        hdr.u8(4).u8(LITTLE_ENDIAN).zeros(2);
    } else {
        hdr.u16(id).u16(cpu as u16).u8(LITTLE_ENDIAN).zeros(7);
    }
    let total = (hdr.len() as u32)
        .checked_add(len)
        .ok_or(Error::InvalidParameter("dump region too large"))?;
    let mut rec = w.record(kind, total)?;
    rec.put(hdr.as_slice())?;
    dump_region(hal, &mut rec, start, end)?;
    rec.close()
}

/// A record read back from a dump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Record kind.
    pub kind: RecordType,
    /// Record payload, without framing.
    pub payload: Vec<u8>,
    /// Stored CRC32 of the payload.
    pub crc: u32,
}

/// Header of a memory-region record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    /// First address dumped.
    pub start: u64,
    /// Number of bytes dumped.
    pub len: u32,
    /// Region index, or `None` for register windows.
    pub id: Option<u16>,
    /// Owning processor, or `None` for register windows.
    pub cpu: Option<CpuType>,
}

/// A firmware version record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FirmwareVersion {
    /// Which firmware: 0 radio, 1 DFE, 2 stream.
    pub id: u32,
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
    /// Patch version.
    pub patch: u16,
    /// Build number.
    pub build: u32,
}

impl Record {
    /// Split a region record into its header and data.
    ///
    /// Returns `None` for other record kinds or a malformed header.
    pub fn region(&self) -> Option<(RegionInfo, &[u8])> {
        let mut r = ByteReader::new(&self.payload);
        let start = r.u64().ok()?;
        let len = r.u32().ok()?;
        let (id, cpu) = match self.kind {
            RecordType::Register => {
                r.bytes(4).ok()?;
                (None, None)
            }
            RecordType::CpuRam | RecordType::Telemetry => {
                let id = r.u16().ok()?;
                let cpu = CpuType::from_raw(r.u16().ok()?)?;
                r.bytes(8).ok()?;
                (Some(id), Some(cpu))
            }
            _ => return None,
        };
        let data = r.bytes(len as usize).ok()?;
        Some((RegionInfo { start, len, id, cpu }, data))
    }

    /// Decode a firmware version record.
    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        if self.kind != RecordType::FirmwareVersion {
            return None;
        }
        let mut r = ByteReader::new(&self.payload);
        let (major, minor, patch) = (r.u16().ok()?, r.u16().ok()?, r.u16().ok()?);
        r.u16().ok()?;
        Some(FirmwareVersion {
            major,
            minor,
            patch,
            build: r.u32().ok()?,
            id: r.u32().ok()?,
        })
    }
}

/// A parsed dump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpFile {
    /// File header.
    pub header: FileHeader,
    /// Records in file order.
    pub records: Vec<Record>,
}

/// Parse a dump and check every CRC.
///
/// # Errors
///
/// [`Error::FileSize`] for a truncated file, [`Error::Checksum`] for a bad
/// header or record CRC, [`Error::FormatRevision`] for an unknown container
/// version, and [`Error::ValueRange`] for an unknown record type.
pub fn parse(data: &[u8]) -> Result<DumpFile, Error> {
    let truncated = |reason| Error::FileSize {
        what: "memory dump",
        size: data.len() as u64,
        reason,
    };
    let head = data
        .get(..FILE_HEADER_SIZE)
        .ok_or_else(|| truncated("shorter than the file header"))?;
    let mut header: FileHeader = bytemuck::pod_read_unaligned(head);
    header.le_convert();
    let actual = crc32(&head[..16]);
    if header.crc != actual {
        return Err(Error::Checksum {
            what: "memory dump header",
            expected: header.crc,
            actual,
        });
    }
    if header.version != DUMP_FORMAT_VERSION {
        return Err(Error::FormatRevision {
            expected: DUMP_FORMAT_VERSION.into(),
            actual: header.version.into(),
        });
    }

    let mut r = ByteReader::new(data);
    r.seek(FILE_HEADER_SIZE)?;
    let mut records = Vec::new();
    while r.remaining() > 0 {
        let short = |_| truncated("record cut short");
        let raw = r.u32().map_err(short)?;
        let len = r.u32().map_err(short)?;
        let kind = RecordType::from_raw(raw).ok_or_else(|| Error::value_range(1..7, raw))?;
        let payload = r.bytes(len as usize).map_err(short)?.to_vec();
        r.bytes(record_padding(len)).map_err(short)?;
        let crc = r.u32().map_err(short)?;
        r.u32().map_err(short)?;
        let actual = crc32(&payload);
        if crc != actual {
            return Err(Error::Checksum {
                what: "memory dump record",
                expected: crc,
                actual,
            });
        }
        records.push(Record { kind, payload, crc });
    }
    Ok(DumpFile { header, records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecoveryAction;
    use crate::sim::{Op, SimHal};

    fn small() -> MemDumpConfig {
        MemDumpConfig {
            force_exception: false,
            timestamp: DumpTime::from_unix(1_700_000_000),
            cpu_ram: vec![(0x0100_0000, 0x0100_01FF)],
            telemetry: vec![],
            registers: vec![],
            dfe_ram: vec![],
            driver_state: Some(b"state".to_vec()),
        }
    }

    #[test]
    fn unix_time() {
        let t = DumpTime::from_unix(1_700_000_000);
        assert_eq!(
            t,
            DumpTime {
                year: 2023,
                month: 11,
                day: 14,
                hour: 22,
                minute: 13,
                second: 20
            }
        );
        assert_eq!(DumpTime::from_unix(0).year, 1970);
        assert_eq!(DumpTime::from_unix(951_782_400).day, 29);
    }

    #[test]
    fn header_layout() {
        let mut hal = SimHal::new();
        hal.mem_mut().set_u8(REG_PRODUCT_ID, 0x91);
        hal.mem_mut().set_u8(REG_SILICON_REV, 0xB0);
        let mut out = Vec::new();
        let n = MemDump::new(&mut hal).write(&mut out, &small()).unwrap();
        assert_eq!(n, out.len() as u64);
        assert_eq!(&out[..4], &[1, 0, 0x91, 0]);
        assert_eq!(&out[6..8], &2023u16.to_le_bytes());
        assert_eq!(&out[16..20], &crc32(&out[..16]).to_le_bytes());
        assert_eq!(out.len() % 8, 0);

        let dump = parse(&out).unwrap();
        assert_eq!(dump.header.revision, 0xB0);
        assert_eq!(dump.header.time(), small().timestamp);
    }

    #[test]
    fn record_order() {
        let mut hal = SimHal::new();
        hal.mem_mut().set_u32(ETM_ENABLE_REGS[1], ETM_ENABLE_BIT);
        let cfg = MemDumpConfig {
            telemetry: vec![(0x2003_0000, 0x2003_000F)],
            registers: vec![(0x4700_0000, 0x4700_0003)],
            dfe_ram: vec![(0x2000_0000, 0x2000_0007)],
            ..small()
        };
        let mut out = Vec::new();
        MemDump::new(&mut hal).write(&mut out, &cfg).unwrap();
        let kinds: Vec<_> = parse(&out).unwrap().records.iter().map(|r| r.kind).collect();
        use RecordType::*;
        assert_eq!(
            kinds,
            vec![
                DriverState,
                FirmwareVersion,
                FirmwareVersion,
                FirmwareVersion,
                EtmTrace,
                CpuRam,
                Telemetry,
                Register,
                CpuRam
            ]
        );
    }

    #[test]
    fn round_trip() {
        let mut hal = SimHal::new();
        let data: Vec<u8> = (0..0x200u32).map(|i| (i * 7) as u8).collect();
        hal.mem_mut().write(0x0100_0000, &data);
        hal.mem_mut()
            .write(FW_VERSION_ADDR[1], &[2, 0, 5, 0, 9, 0, 0, 0, 0x34, 0x12, 0, 0]);
        let mut out = Vec::new();
        MemDump::new(&mut hal).write(&mut out, &small()).unwrap();
        let dump = parse(&out).unwrap();

        let state = &dump.records[0];
        assert_eq!(&state.payload[24..], b"state");

        let fw = dump.records[2].firmware_version().unwrap();
        assert_eq!((fw.id, fw.major, fw.minor, fw.patch, fw.build), (1, 2, 5, 9, 0x1234));

        let ram = &dump.records[4];
        let (info, bytes) = ram.region().unwrap();
        assert_eq!(info.start, 0x0100_0000);
        assert_eq!(info.len, 0x200);
        assert_eq!(info.cpu, Some(CpuType::ArmV7));
        assert_eq!(bytes, data.as_slice());
        assert_eq!(crc32(&ram.payload), ram.crc);
    }

    #[test]
    fn corrupt_record_rejected() {
        let mut hal = SimHal::new();
        let mut out = Vec::new();
        MemDump::new(&mut hal).write(&mut out, &small()).unwrap();
        let last = out.len() - 20;
        out[last] ^= 0xFF;
        assert!(matches!(parse(&out), Err(Error::Checksum { .. })));
        out.truncate(out.len() - 3);
        assert!(parse(&out).is_err());
    }

    #[test]
    fn single_word_region() {
        let mut hal = SimHal::new();
        hal.mem_mut().set_u8(0x0100_0010, 0x5A);
        let cfg = MemDumpConfig {
            cpu_ram: vec![(0x0100_0010, 0x0100_0010), (0, 0x100)],
            ..small()
        };
        let mut out = Vec::new();
        MemDump::new(&mut hal).write(&mut out, &cfg).unwrap();
        let dump = parse(&out).unwrap();
        let regions: Vec<_> = dump.records.iter().filter_map(Record::region).collect();
        // The zero-based entry is skipped.
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].1, &[0x5A]);
    }

    #[test]
    fn spi_only_and_semaphore_windows() {
        let mut hal = SimHal::new();
        hal.mem_mut().write(HW_SEMAPHORE_ADDR, &[1, 2, 3, 4]);
        let cfg = MemDumpConfig {
            cpu_ram: vec![],
            registers: vec![
                (SPI_ONLY_REGS_ADDR, SPI_ONLY_REGS_ADDR + 3),
                (HW_SEMAPHORE_ADDR, HW_SEMAPHORE_ADDR + 3),
            ],
            ..small()
        };
        let mut out = Vec::new();
        MemDump::new(&mut hal).write(&mut out, &cfg).unwrap();
        let ops = hal.ops();
        let byte_reads = ops
            .iter()
            .filter(|op| match op {
                Op::Read8 { addr } => in_window(*addr, SPI_ONLY_REGS_ADDR, SPI_ONLY_REGS_SIZE),
                _ => false,
            })
            .count();
        assert_eq!(byte_reads, 4);
        assert!(!ops
            .iter()
            .any(|op| matches!(op, Op::ReadBytes { addr, .. } if *addr == SPI_ONLY_REGS_ADDR)));
        let read = ops
            .iter()
            .position(|op| matches!(op, Op::ReadBytes { addr, .. } if *addr == HW_SEMAPHORE_ADDR))
            .unwrap();
        assert_eq!(
            ops[read + 1],
            Op::WriteBytes {
                addr: HW_SEMAPHORE_ADDR,
                len: 4
            }
        );
    }

    #[test]
    fn slice_clocks_restored() {
        let mut hal = SimHal::new();
        hal.mem_mut().set_u8(REG_TX_SLICE_CLK_EN, 0x01);
        let mut out = Vec::new();
        MemDump::new(&mut hal)
            .initialized_tx(TxChannels::TX0 | TxChannels::TX1)
            .write(&mut out, &small())
            .unwrap();
        let writes: Vec<_> = hal
            .ops()
            .iter()
            .filter_map(|op| match op {
                Op::Write8 { addr, val } if *addr == REG_TX_SLICE_CLK_EN => Some(*val),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![0xFD, 0x01]);
    }

    #[test]
    fn clocks_restored_after_failed_write() {
        let mut hal = SimHal::new();
        hal.mem_mut().set_u8(REG_TX_SLICE_CLK_EN, 0x01);
        let e = MemDump::new(&mut hal)
            .initialized_tx(TxChannels::TX0)
            .write(&mut FailingWriter, &small())
            .unwrap_err();
        assert!(matches!(e, Error::Io(_)));
        assert_eq!(hal.mem().u8(REG_TX_SLICE_CLK_EN), 0x01);

        let mut hal = SimHal::new();
        hal.fail_writes_at(Some(REG_TX_SLICE_CLK_EN));
        let e = MemDump::new(&mut hal)
            .initialized_tx(TxChannels::empty())
            .write(&mut Vec::new(), &small())
            .unwrap_err();
        assert!(matches!(e, Error::Interface(_)));
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn forced_exception() {
        let mut hal = SimHal::new();
        let cfg = MemDumpConfig {
            force_exception: true,
            ..small()
        };
        MemDump::new(&mut hal).write(&mut Vec::new(), &cfg).unwrap();
        assert_eq!(hal.mem().u8(REG_DFE_BOOT_STATUS), DFE_BOOT_STATUS_EXCEPTION_DONE);

        let mut hal = SimHal::new();
        hal.honor_force_exception(false);
        let mut out = Vec::new();
        let e = MemDump::new(&mut hal).write(&mut out, &cfg).unwrap_err();
        assert_eq!(e.recovery_action(), RecoveryAction::ResetDevice);
        assert!(out.is_empty());
    }

    #[test]
    fn bad_region_checked_first() {
        let mut hal = SimHal::new();
        let cfg = MemDumpConfig {
            registers: vec![(0x4700_0010, 0x4700_0000)],
            force_exception: true,
            ..small()
        };
        let e = MemDump::new(&mut hal).write(&mut Vec::new(), &cfg).unwrap_err();
        assert!(matches!(e, Error::AddressRange { .. }));
        assert!(hal.ops().is_empty());
    }
}
