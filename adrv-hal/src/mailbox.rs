/*!
Co-processor command and mailbox client.

Commands are an even opcode plus up to four extension bytes. The driver waits
for the command interface to go idle, writes the extension registers and then
the opcode, and polls a per-opcode status nibble until the command completes.
Payloads too large for the extension bytes travel through two shared-memory
windows: [`MAILBOX_SET`] for data going to the co-processor and
[`MAILBOX_GET`] for data coming back.

A non-zero error field in the completion status becomes
[`Error::Firmware`]. Commands are never retried.
*/

use tracing::{trace, warn};

use crate::consts::*;
use crate::hal::Hal;
use crate::poll::{self, PollPolicy};
use crate::Error;

/// Synchronous command client. Borrows the HAL for the duration of a call
/// sequence.
pub struct Mailbox<'a, H: Hal + ?Sized> {
    hal: &'a mut H,
    idle: PollPolicy,
    complete: PollPolicy,
}

impl<'a, H: Hal + ?Sized> Mailbox<'a, H> {
    /// A client using the default idle and completion waits.
    pub fn new(hal: &'a mut H) -> Self {
        Self {
            hal,
            idle: poll::MAILBOX_IDLE,
            complete: poll::MAILBOX_COMPLETE,
        }
    }

    /// Use a different completion wait, for commands known to take longer.
    pub fn with_completion(mut self, policy: PollPolicy) -> Self {
        self.complete = policy;
        self
    }

    /// Borrow the underlying HAL.
    pub fn hal(&mut self) -> &mut H {
        self.hal
    }

    fn check_exception(&mut self) -> Result<(), Error> {
        for reg in [REG_CPU0_EXCEPTION, REG_CPU1_EXCEPTION] {
            let code = self.hal.read_u32(reg)?;
            if code != 0 {
                warn!("CPU exception 0x{code:08x} (register 0x{reg:04x})");
                return Err(Error::CpuException { code });
            }
        }
        Ok(())
    }

    /// Issue a command without waiting for it to complete.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] for an odd or out-of-range opcode or too
    /// many extension bytes. [`Error::CpuException`] or [`Error::Timeout`] if
    /// the command interface never goes idle.
    pub fn command_write(&mut self, opcode: u8, ext: &[u8]) -> Result<(), Error> {
        if opcode & 1 != 0 || opcode > OPCODE_MAX {
            return Err(Error::InvalidParameter("opcode must be even and at most 30"));
        }
        if ext.len() > CPU_MAX_EXT_BYTES {
            return Err(Error::InvalidParameter("at most 4 extension bytes"));
        }
        let idle = self.idle.poll(&mut *self.hal, "command interface idle", |h| {
            Ok((h.read_u8(REG_CPU_COMMAND)? & CPU_COMMAND_BUSY == 0).then_some(()))
        });
        if let Err(e) = idle {
            self.check_exception()?;
            return Err(e);
        }
        for (i, b) in ext.iter().enumerate() {
            self.hal.write_u8(REG_CPU_EXT_CMD + i as u32, *b)?;
        }
        trace!("command 0x{opcode:02x} ext {ext:02x?}");
        self.hal.write_u8(REG_CPU_COMMAND, opcode)
    }

    /// Wait for the command with `opcode` to complete.
    ///
    /// `object_id` is only used to label a firmware error. Returns the final
    /// status nibble.
    ///
    /// # Errors
    ///
    /// [`Error::Firmware`] if the command completed with an error;
    /// [`Error::CpuException`] or [`Error::Timeout`] if it never completed.
    pub fn status_wait(&mut self, opcode: u8, object_id: u8) -> Result<u8, Error> {
        let addr = REG_CPU_CMD_STATUS + (opcode as u32 >> 2);
        let high = (opcode >> 1) & 1 != 0;
        let done = self.complete.poll(&mut *self.hal, "command completion", |h| {
            let raw = h.read_u8(addr)?;
            let status = if high { raw >> 4 } else { raw & 0x0F };
            if status & CMD_STATUS_ERROR != 0 {
                let status = (status & CMD_STATUS_ERROR) >> 1;
                warn!(
                    "command 0x{opcode:02x} object 0x{object_id:02x} failed, status 0x{status:x}"
                );
                return Err(Error::Firmware {
                    opcode,
                    object_id,
                    status,
                });
            }
            Ok((status & CMD_STATUS_PENDING == 0).then_some(status))
        });
        match done {
            Err(e @ Error::Timeout { .. }) => {
                self.check_exception()?;
                Err(e)
            }
            other => other,
        }
    }

    /// Issue a command and wait for it to complete.
    ///
    /// Errors are labelled with the target object: the second extension byte,
    /// or the first if that's all there is.
    pub fn exec(&mut self, opcode: u8, ext: &[u8]) -> Result<(), Error> {
        self.command_write(opcode, ext)?;
        let object = ext.get(1).or(ext.first()).copied().unwrap_or(0);
        self.status_wait(opcode, object)?;
        Ok(())
    }

    /// Write into co-processor memory.
    pub fn mem_write(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        self.hal.write_bytes(addr, data)
    }

    /// Read from co-processor memory.
    pub fn mem_read(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        self.hal.read_bytes(addr, &mut buf)?;
        Ok(buf)
    }

    /// Write `data` into a configuration object at byte `offset`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] if `data` is longer than 255 bytes,
    /// otherwise as [`exec`](Self::exec).
    pub fn config_write(&mut self, object_id: u8, offset: u16, data: &[u8]) -> Result<(), Error> {
        let len: u8 = data
            .len()
            .try_into()
            .map_err(|_| Error::InvalidParameter("config write longer than 255 bytes"))?;
        self.hal.write_u8(MAILBOX_SET, len)?;
        self.hal.write_bytes(MAILBOX_SET + 1, data)?;
        let [lo, hi] = offset.to_le_bytes();
        self.exec(OPCODE_SET, &[OBJID_CONFIG, object_id, lo, hi])
    }

    /// Read `len` bytes of a configuration object starting at `offset`.
    pub fn config_read(&mut self, object_id: u8, offset: u16, len: u8) -> Result<Vec<u8>, Error> {
        self.hal.write_u8(MAILBOX_GET, len)?;
        let [lo, hi] = offset.to_le_bytes();
        self.exec(OPCODE_GET, &[OBJID_CONFIG, object_id, lo, hi])?;
        self.mem_read(MAILBOX_GET, len as usize)
    }

    /// Fetch `len` bytes of calibration status for `object_id` on the
    /// channel(s) in `channel_sel`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] if `len` doesn't fit the GET window.
    pub fn status_get(
        &mut self,
        object_id: u8,
        channel_sel: u8,
        len: usize,
    ) -> Result<Vec<u8>, Error> {
        if len > MAILBOX_WINDOW_SIZE {
            return Err(Error::InvalidParameter("status larger than the mailbox window"));
        }
        self.exec(OPCODE_GET, &[OBJID_CAL_STATUS, object_id, channel_sel])?;
        self.mem_read(MAILBOX_GET, len)
    }

    /// Send a tracking-calibration control command with `payload`.
    pub fn tracking_ctrl_set(
        &mut self,
        object_id: u8,
        channel_sel: u8,
        ctrl: u8,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.mem_write(MAILBOX_SET, payload)?;
        self.exec(OPCODE_SET, &[OBJID_TRACKING_CAL_CTRL, object_id, channel_sel, ctrl])
    }

    /// Send a tracking-calibration query with `request` and read back
    /// `resp_len` bytes of response from the set window.
    pub fn tracking_ctrl_get(
        &mut self,
        object_id: u8,
        channel_sel: u8,
        ctrl: u8,
        request: &[u8],
        resp_len: usize,
    ) -> Result<Vec<u8>, Error> {
        self.mem_write(MAILBOX_SET, request)?;
        self.exec(OPCODE_SET, &[OBJID_TRACKING_CAL_CTRL, object_id, channel_sel, ctrl])?;
        self.mem_read(MAILBOX_SET, resp_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecoveryAction;
    use crate::sim::{Command, SimHal};

    #[test]
    fn rejects_bad_opcodes() {
        let mut hal = SimHal::new();
        let mut mb = Mailbox::new(&mut hal);
        assert!(matches!(mb.command_write(3, &[]), Err(Error::InvalidParameter(_))));
        assert!(matches!(mb.command_write(32, &[]), Err(Error::InvalidParameter(_))));
        assert!(matches!(
            mb.command_write(OPCODE_SET, &[0; 5]),
            Err(Error::InvalidParameter(_))
        ));
        assert!(hal.commands().is_empty());
    }

    #[test]
    fn waits_for_idle_and_completion() {
        let mut hal = SimHal::new();
        hal.set_busy_reads(3);
        hal.set_pending_polls(2);
        Mailbox::new(&mut hal)
            .exec(OPCODE_GET, &[OBJID_CAL_STATUS, OBJID_DPD_TRACKING, 1])
            .unwrap();
        assert_eq!(
            hal.commands(),
            vec![Command {
                opcode: OPCODE_GET,
                ext: [OBJID_CAL_STATUS, OBJID_DPD_TRACKING, 1, 0]
            }]
        );
        // Three busy polls and two pending polls, each followed by a wait.
        assert_eq!(hal.now_us(), 5 * 1000);
    }

    #[test]
    fn firmware_error() {
        let mut hal = SimHal::new();
        hal.on_command(|_, _| Some(0x6));
        let e = Mailbox::new(&mut hal)
            .exec(OPCODE_SET, &[OBJID_TRACKING_CAL_CTRL, OBJID_CFR_INIT, 1, 0x84])
            .unwrap_err();
        match e {
            Error::Firmware {
                opcode,
                object_id,
                status,
            } => {
                assert_eq!(opcode, OPCODE_SET);
                assert_eq!(object_id, OBJID_CFR_INIT);
                assert_eq!(status, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stuck_interface_reports_exception() {
        let mut hal = SimHal::new();
        hal.set_busy_reads(u32::MAX);
        hal.mem_mut().set_u32(REG_CPU1_EXCEPTION, 0xbad);
        let e = Mailbox::new(&mut hal).exec(OPCODE_SET, &[]).unwrap_err();
        assert!(matches!(e, Error::CpuException { code: 0xbad }));
        assert_eq!(e.recovery_action(), RecoveryAction::ResetDevice);

        let mut hal = SimHal::new();
        hal.set_pending_polls(u32::MAX);
        let e = Mailbox::new(&mut hal)
            .with_completion(PollPolicy::new(3, 10))
            .exec(OPCODE_SET, &[])
            .unwrap_err();
        assert!(matches!(e, Error::Timeout { .. }));
        assert_eq!(hal.now_us(), 20);
    }

    #[test]
    fn config_round_trip() {
        let mut hal = SimHal::new();
        let mut mb = Mailbox::new(&mut hal);
        mb.config_write(OBJID_CLGC_TRACKING, 56, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mb.config_read(OBJID_CLGC_TRACKING, 57, 2).unwrap(), vec![2, 3]);
        assert_eq!(&hal.config_object(OBJID_CLGC_TRACKING)[56..60], &[1, 2, 3, 4]);
    }
}
