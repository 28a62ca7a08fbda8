/*!
In-memory device model.

[`SimHal`] implements [`Hal`] over a sparse byte memory and adds just enough
device behavior to exercise the driver without hardware:

- The co-processor mailbox. Writing an opcode to the command register
  records a [`Command`], runs an optional user responder, and posts a
  completion status. Config-object writes and reads are stored.
- The radio sequencers. `reset_hold` drives the debug state, RadioStop parks
  the frame-timing sequencers, and `apply_now` moves released sequencers to
  their `pointer_init` address.
- The forced-exception handshake used by memory dumps.
- A virtual clock advanced by [`Hal::wait_us`].

Every access is logged as an [`Op`] so tests can check ordering.

```
use adrv_hal::hal::Hal;
use adrv_hal::sim::{Op, SimHal};

# fn main() -> Result<(), adrv_hal::Error> {
let mut hal = SimHal::new();
hal.write_u32(0x2000_0000, 0xdead_beef)?;
assert_eq!(hal.read_u32(0x2000_0000)?, 0xdead_beef);
assert!(matches!(hal.ops()[0], Op::Write32 { addr: 0x2000_0000, .. }));
# Ok(())
# }
```
*/

use std::collections::HashMap;

use crate::consts::*;
use crate::hal::Hal;
use crate::Error;

/// One logged access to a [`SimHal`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Op {
    Read8 { addr: u32 },
    Write8 { addr: u32, val: u8 },
    Read32 { addr: u32 },
    Write32 { addr: u32, val: u32 },
    ReadBytes { addr: u32, len: usize },
    WriteBytes { addr: u32, len: usize },
    Streaming(bool),
    /// A co-processor command was issued.
    Command(Command),
}

/// A co-processor command as seen by the simulated mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Command {
    /// Command opcode.
    pub opcode: u8,
    /// Extension bytes, as present in the extension registers at issue time.
    pub ext: [u8; 4],
}

/// Sparse byte-addressed memory. Unwritten bytes read as zero.
#[derive(Clone, Debug, Default)]
pub struct SimMemory {
    bytes: HashMap<u32, u8>,
}

impl SimMemory {
    /// Read one byte.
    pub fn u8(&self, addr: u32) -> u8 {
        self.bytes.get(&addr).copied().unwrap_or(0)
    }

    /// Write one byte.
    pub fn set_u8(&mut self, addr: u32, val: u8) {
        self.bytes.insert(addr, val);
    }

    /// Read a little-endian word.
    pub fn u32(&self, addr: u32) -> u32 {
        let mut b = [0u8; 4];
        self.read(addr, &mut b);
        u32::from_le_bytes(b)
    }

    /// Write a little-endian word.
    pub fn set_u32(&mut self, addr: u32, val: u32) {
        self.write(addr, &val.to_le_bytes());
    }

    /// Fill `buf` from memory.
    pub fn read(&self, addr: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.u8(addr.wrapping_add(i as u32));
        }
    }

    /// Copy `data` into memory.
    pub fn write(&mut self, addr: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.set_u8(addr.wrapping_add(i as u32), *b);
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Pending {
    addr: u32,
    high: bool,
    status: u8,
    remaining: u32,
}

type Responder = Box<dyn FnMut(&mut SimMemory, &Command) -> Option<u8>>;
type ReadHook = Box<dyn FnMut(u32) -> u32>;

/// Simulated transceiver. See the [module documentation](self).
pub struct SimHal {
    mem: SimMemory,
    ops: Vec<Op>,
    now_us: u64,
    streaming: bool,
    fail_streaming_exit: bool,
    fail_write_addr: Option<u32>,
    responder: Option<Responder>,
    read_hooks: HashMap<u32, ReadHook>,
    config_store: HashMap<u8, Vec<u8>>,
    busy_reads: u32,
    pending_polls: u32,
    pending: Option<Pending>,
    park_pc: u32,
    sequencers_stalled: bool,
    honor_force_exception: bool,
}

impl Default for SimHal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimHal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHal")
            .field("ops", &self.ops.len())
            .field("now_us", &self.now_us)
            .field("streaming", &self.streaming)
            .finish_non_exhaustive()
    }
}

impl SimHal {
    /// A device with empty memory and a co-processor that completes every
    /// command successfully.
    pub fn new() -> Self {
        Self {
            mem: SimMemory::default(),
            ops: Vec::new(),
            now_us: 0,
            streaming: false,
            fail_streaming_exit: false,
            fail_write_addr: None,
            responder: None,
            read_hooks: HashMap::new(),
            config_store: HashMap::new(),
            busy_reads: 0,
            pending_polls: 0,
            pending: None,
            park_pc: 0,
            sequencers_stalled: false,
            honor_force_exception: true,
        }
    }

    /// Direct access to the backing memory, bypassing the op log.
    pub fn mem(&self) -> &SimMemory {
        &self.mem
    }

    /// Mutable access to the backing memory, bypassing the op log.
    pub fn mem_mut(&mut self) -> &mut SimMemory {
        &mut self.mem
    }

    /// Every access so far, oldest first.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Forget the op log.
    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// Every co-processor command issued so far.
    pub fn commands(&self) -> Vec<Command> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Command(c) => Some(*c),
                _ => None,
            })
            .collect()
    }

    /// Virtual time slept so far.
    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    /// True while SPI streaming mode is on.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Make leaving streaming mode fail.
    pub fn fail_streaming_exit(&mut self, fail: bool) {
        self.fail_streaming_exit = fail;
    }

    /// Make any write touching `addr` fail with [`Error::Interface`].
    pub fn fail_writes_at(&mut self, addr: Option<u32>) {
        self.fail_write_addr = addr;
    }

    /// Install a command responder.
    ///
    /// It runs after the command is logged and before the built-in handling.
    /// Returning `Some(status)` posts that status nibble and skips the
    /// built-in handling; `None` falls through to it.
    pub fn on_command<F>(&mut self, f: F)
    where
        F: FnMut(&mut SimMemory, &Command) -> Option<u8> + 'static,
    {
        self.responder = Some(Box::new(f));
    }

    /// Transform every 32-bit read of `addr`. The hook gets the stored value.
    pub fn hook_read_u32<F>(&mut self, addr: u32, f: F)
    where
        F: FnMut(u32) -> u32 + 'static,
    {
        self.read_hooks.insert(addr, Box::new(f));
    }

    /// Report the command interface busy for the next `n` polls.
    pub fn set_busy_reads(&mut self, n: u32) {
        self.busy_reads = n;
    }

    /// Report every following command pending for its first `n` status
    /// polls.
    pub fn set_pending_polls(&mut self, n: u32) {
        self.pending_polls = n;
    }

    /// Program counter the frame-timing sequencers park on after RadioStop.
    pub fn set_park_pc(&mut self, pc: u32) {
        self.park_pc = pc;
    }

    /// Make the sequencers ignore RadioStop and `reset_hold`.
    pub fn stall_sequencers(&mut self, stall: bool) {
        self.sequencers_stalled = stall;
    }

    /// Whether the processors react to a forced-exception request.
    pub fn honor_force_exception(&mut self, honor: bool) {
        self.honor_force_exception = honor;
    }

    /// Contents of a co-processor config object.
    pub fn config_object(&self, object_id: u8) -> &[u8] {
        self.config_store
            .get(&object_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn check_write(&self, addr: u32, len: usize) -> Result<(), Error> {
        if let Some(bad) = self.fail_write_addr {
            if bad >= addr && (bad - addr) < len as u32 {
                return Err(Error::Interface("simulated write failure"));
            }
        }
        Ok(())
    }

    fn rs_channel(addr: u32) -> Option<(u32, u32)> {
        let end = RS_CHAN_BASE + RS_NUM_SEQUENCERS * RS_CHAN_STRIDE;
        if (RS_CHAN_BASE..end).contains(&addr) {
            let off = addr - RS_CHAN_BASE;
            Some((off / RS_CHAN_STRIDE, off % RS_CHAN_STRIDE))
        } else {
            None
        }
    }

    fn after_write_u32(&mut self, addr: u32, val: u32) {
        if self.sequencers_stalled {
            return;
        }
        if let Some((ch, RS_CFG0_OFFSET)) = Self::rs_channel(addr) {
            let dbg = if val & RS_RESET_HOLD_BIT != 0 {
                RS_DBG_STATE_RESET
            } else {
                RS_DBG_STATE_RUN
            };
            let dbg_addr = RS_CHAN_BASE + ch * RS_CHAN_STRIDE + RS_DBG_STATE_OFFSET;
            self.mem.set_u32(dbg_addr, dbg);
        } else if addr == RS_APPLY_NOW && val != 0 {
            for ch in 0..RS_NUM_SEQUENCERS {
                let base = RS_CHAN_BASE + ch * RS_CHAN_STRIDE;
                if self.mem.u32(base + RS_CFG0_OFFSET) & RS_RESET_HOLD_BIT != 0 {
                    continue;
                }
                let ptr = self.mem.u32(base + RS_POINTER_INIT_OFFSET);
                self.mem
                    .set_u32(RS_SEQ_PC_BASE + ch * 4, (ptr << 4) & RS_PC_MASK);
            }
            self.mem.set_u32(RS_APPLY_NOW, 0);
        }
    }

    fn after_write_u8(&mut self, addr: u32, val: u8) {
        match addr {
            REG_CPU_COMMAND => self.issue(val),
            REG_CPU_FORCE_EXCEPTION if val == CPU_FORCE_EXCEPTION_CMD => {
                if self.honor_force_exception {
                    self.mem.set_u32(REG_CPU0_EXCEPTION, 0x0000_0F01);
                    self.mem.set_u32(REG_CPU1_EXCEPTION, 0x0000_0F02);
                    self.mem
                        .set_u8(REG_DFE_BOOT_STATUS, DFE_BOOT_STATUS_EXCEPTION_DONE);
                }
            }
            _ => (),
        }
    }

    fn issue(&mut self, opcode: u8) {
        let mut ext = [0u8; 4];
        self.mem.read(REG_CPU_EXT_CMD, &mut ext);
        let cmd = Command { opcode, ext };
        self.ops.push(Op::Command(cmd));

        let mut status = None;
        if let Some(r) = self.responder.as_mut() {
            status = r(&mut self.mem, &cmd);
        }
        let status = status.unwrap_or_else(|| self.builtin(&cmd));

        let addr = REG_CPU_CMD_STATUS + (opcode as u32 >> 2);
        let high = (opcode >> 1) & 1 != 0;
        if self.pending_polls > 0 {
            self.pending = Some(Pending {
                addr,
                high,
                status,
                remaining: self.pending_polls,
            });
            self.set_status_nibble(addr, high, CMD_STATUS_PENDING);
        } else {
            self.set_status_nibble(addr, high, status);
        }
        self.mem.set_u8(REG_CPU_COMMAND, opcode & !CPU_COMMAND_BUSY);
    }

    fn set_status_nibble(&mut self, addr: u32, high: bool, status: u8) {
        let old = self.mem.u8(addr);
        let new = if high {
            (old & 0x0F) | ((status & 0x0F) << 4)
        } else {
            (old & 0xF0) | (status & 0x0F)
        };
        self.mem.set_u8(addr, new);
    }

    /// Built-in co-processor behavior. Returns the status nibble.
    fn builtin(&mut self, cmd: &Command) -> u8 {
        match (cmd.opcode, cmd.ext[0]) {
            (OPCODE_RADIO_OFF, _) => {
                if !self.sequencers_stalled {
                    for seq in 0..RS_NUM_FRAME_TIMING_SEQUENCERS {
                        self.mem.set_u32(RS_SEQ_PC_BASE + seq * 4, self.park_pc);
                    }
                }
                0
            }
            (OPCODE_SET, OBJID_CONFIG) => {
                let obj = cmd.ext[1];
                let off = u16::from_le_bytes([cmd.ext[2], cmd.ext[3]]) as usize;
                let len = self.mem.u8(MAILBOX_SET) as usize;
                let mut data = vec![0u8; len];
                self.mem.read(MAILBOX_SET + 1, &mut data);
                let store = self.config_store.entry(obj).or_default();
                if store.len() < off + len {
                    store.resize(off + len, 0);
                }
                store[off..off + len].copy_from_slice(&data);
                0
            }
            (OPCODE_GET, OBJID_CONFIG) => {
                let obj = cmd.ext[1];
                let off = u16::from_le_bytes([cmd.ext[2], cmd.ext[3]]) as usize;
                let len = self.mem.u8(MAILBOX_GET) as usize;
                let mut data = vec![0u8; len];
                if let Some(store) = self.config_store.get(&obj) {
                    for (i, b) in data.iter_mut().enumerate() {
                        *b = store.get(off + i).copied().unwrap_or(0);
                    }
                }
                self.mem.write(MAILBOX_GET, &data);
                0
            }
            _ => 0,
        }
    }

    fn on_read_u8(&mut self, addr: u32) -> u8 {
        if addr == REG_CPU_COMMAND && self.busy_reads > 0 {
            self.busy_reads -= 1;
            return self.mem.u8(addr) | CPU_COMMAND_BUSY;
        }
        if let Some(mut p) = self.pending {
            if p.addr == addr {
                if p.remaining > 0 {
                    p.remaining -= 1;
                    self.pending = Some(p);
                } else {
                    self.pending = None;
                    self.set_status_nibble(p.addr, p.high, p.status);
                }
            }
        }
        self.mem.u8(addr)
    }
}

impl Hal for SimHal {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Error> {
        self.ops.push(Op::Read8 { addr });
        Ok(self.on_read_u8(addr))
    }

    fn write_u8(&mut self, addr: u32, val: u8) -> Result<(), Error> {
        self.ops.push(Op::Write8 { addr, val });
        self.check_write(addr, 1)?;
        self.mem.set_u8(addr, val);
        self.after_write_u8(addr, val);
        Ok(())
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, Error> {
        self.ops.push(Op::Read32 { addr });
        let v = self.mem.u32(addr);
        Ok(match self.read_hooks.get_mut(&addr) {
            Some(hook) => hook(v),
            None => v,
        })
    }

    fn write_u32(&mut self, addr: u32, val: u32) -> Result<(), Error> {
        self.ops.push(Op::Write32 { addr, val });
        self.check_write(addr, 4)?;
        self.mem.set_u32(addr, val);
        self.after_write_u32(addr, val);
        Ok(())
    }

    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.ops.push(Op::ReadBytes {
            addr,
            len: buf.len(),
        });
        self.mem.read(addr, buf);
        Ok(())
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        self.ops.push(Op::WriteBytes {
            addr,
            len: data.len(),
        });
        self.check_write(addr, data.len())?;
        self.mem.write(addr, data);
        Ok(())
    }

    fn set_streaming(&mut self, enable: bool) -> Result<(), Error> {
        self.ops.push(Op::Streaming(enable));
        if !enable && self.fail_streaming_exit {
            return Err(Error::Interface("simulated streaming exit failure"));
        }
        self.streaming = enable;
        Ok(())
    }

    fn wait_us(&mut self, us: u32) {
        self.now_us += us as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_posts_status() {
        let mut hal = SimHal::new();
        hal.write_u8(REG_CPU_EXT_CMD, 7).unwrap();
        hal.on_command(|_, c| (c.ext[0] == 7).then_some(0x4));
        hal.write_u8(REG_CPU_COMMAND, OPCODE_SET).unwrap();
        assert_eq!(
            hal.commands(),
            vec![Command {
                opcode: OPCODE_SET,
                ext: [7, 0, 0, 0]
            }]
        );
        // SET = 0x0A: byte 0xD2, high nibble.
        assert_eq!(hal.mem().u8(REG_CPU_CMD_STATUS + 2) >> 4, 0x4);
    }

    #[test]
    fn reset_hold_drives_debug_state() {
        let mut hal = SimHal::new();
        let cfg0 = RS_CHAN_BASE + 3 * RS_CHAN_STRIDE;
        hal.write_u32(cfg0, RS_RESET_HOLD_BIT).unwrap();
        assert_eq!(hal.mem().u32(cfg0 + RS_DBG_STATE_OFFSET), RS_DBG_STATE_RESET);
        hal.write_u32(cfg0, 0).unwrap();
        assert_eq!(hal.mem().u32(cfg0 + RS_DBG_STATE_OFFSET), RS_DBG_STATE_RUN);
    }

    #[test]
    fn write_failure_injection() {
        let mut hal = SimHal::new();
        hal.fail_writes_at(Some(0x1002));
        assert!(hal.write_bytes(0x1000, &[0; 2]).is_ok());
        assert!(matches!(
            hal.write_bytes(0x1000, &[0; 4]),
            Err(Error::Interface(_))
        ));
    }

    #[test]
    fn read_hook() {
        let mut hal = SimHal::new();
        let mut n = 0;
        hal.hook_read_u32(0x10, move |v| {
            n += 1;
            v + n
        });
        assert_eq!(hal.read_u32(0x10).unwrap(), 1);
        assert_eq!(hal.read_u32(0x10).unwrap(), 2);
    }
}
