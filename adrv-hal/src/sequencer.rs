/*!
Radio-sequencer lifecycle.

The radio sequencer is a bank of 16 micro-sequencers running a program image
out of on-chip memory. The first 10 are frame-timing sequencers that follow
the air-interface schedule. The program's pattern lookup table lives twice:
once in the loaded program and once in the co-processor, which uses it to
schedule patterns. The two must always match, so every image load is followed
by a push of the new table.

States move as follows:

```text
Unloaded --load_image--> LoadedIdle --start--> Running
Running --stop--> LoadedIdle
Running/LoadedIdle --reload--> Stopping --> Reloading --> LoadedIdle (--> Running)
```

A reload while running parks every frame-timing sequencer on the null pattern
before touching anything, then holds all sequencers in reset while the new
program goes in. If the sequencer was running before, it is restarted
afterwards; otherwise it stays parked until [`Sequencer::start`].

```
use adrv_hal::sequencer::SequencerState;
use adrv_hal::validate::RsImage;
use adrv_hal::{sim::SimHal, Device};

# fn main() -> Result<(), adrv_hal::Error> {
let image = RsImage::new(vec![0x100, 0x200], [0; 64], vec![0; 64]).to_bytes();
let mut device = Device::new(SimHal::new());
device.sequencer().load_image_bytes(&image)?;
device.sequencer().start()?;
assert_eq!(device.sequencer().state(), SequencerState::Running);
# Ok(())
# }
```
*/

use std::path::Path;

use tracing::{debug, info};

use crate::codec::ByteWriter;
use crate::consts::*;
use crate::error::keep_first;
use crate::hal::{modify_u32, write_chunked, Hal, StreamingGuard};
use crate::mailbox::Mailbox;
use crate::poll;
use crate::validate::RsImage;
use crate::Error;

/// Where the radio sequencer is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SequencerState {
    /// No program has been loaded.
    #[default]
    Unloaded,
    /// A program is loaded and the radio is off. The sequencers may be
    /// held, parked or released onto the startup pattern.
    LoadedIdle,
    /// The radio is on and the sequencers are running the loaded program.
    Running,
    /// A reload is parking the running sequencers.
    Stopping,
    /// A reload is replacing the program.
    Reloading,
}

/// What the driver keeps of a loaded sequencer image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RsImageInfo {
    /// Program address of each pattern.
    pub lookup_table: Vec<u32>,
    /// CRC of the lookup table.
    pub lookup_crc: u32,
    /// Crossbar settings.
    pub xbar: Vec<u8>,
}

impl From<&RsImage> for RsImageInfo {
    fn from(img: &RsImage) -> Self {
        Self {
            lookup_table: img.lookup_table.clone(),
            lookup_crc: img.lookup_crc,
            xbar: img.xbar.to_vec(),
        }
    }
}

/// Radio-sequencer state held by a [`Device`][crate::Device].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RsContext {
    /// Lifecycle state.
    pub state: SequencerState,
    /// Whether the profile enables the sequencer. Enabled until a profile
    /// says otherwise.
    pub radio_seq_en: bool,
    /// Set once [`Sequencer::start`] has released the sequencers.
    pub started: bool,
    /// Set while the radio is on (after RadioStart, until RadioStop).
    pub running: bool,
    /// The loaded image.
    pub image: Option<RsImageInfo>,
}

impl Default for RsContext {
    fn default() -> Self {
        Self {
            state: SequencerState::Unloaded,
            radio_seq_en: true,
            started: false,
            running: false,
            image: None,
        }
    }
}

fn cfg0(ch: u32) -> u32 {
    RS_CHAN_BASE + ch * RS_CHAN_STRIDE + RS_CFG0_OFFSET
}

fn chan_reg(ch: u32, offset: u32) -> u32 {
    RS_CHAN_BASE + ch * RS_CHAN_STRIDE + offset
}

/// Radio-sequencer operations. Get one with
/// [`Device::sequencer`][crate::Device::sequencer].
pub struct Sequencer<'a, H: Hal + ?Sized> {
    hal: &'a mut H,
    ctx: &'a mut RsContext,
}

impl<'a, H: Hal + ?Sized> Sequencer<'a, H> {
    /// Sequencer operations on a bare HAL and context.
    pub fn new(hal: &'a mut H, ctx: &'a mut RsContext) -> Self {
        Self { hal, ctx }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SequencerState {
        self.ctx.state
    }

    /// The loaded image, if any.
    pub fn image(&self) -> Option<&RsImageInfo> {
        self.ctx.image.as_ref()
    }

    fn loaded(&self) -> Result<&RsImageInfo, Error> {
        self.ctx
            .image
            .as_ref()
            .ok_or(Error::State("no radio sequencer image loaded"))
    }

    fn set_state(&mut self, state: SequencerState) {
        if self.ctx.state != state {
            info!("radio sequencer: {:?} -> {:?}", self.ctx.state, state);
            self.ctx.state = state;
        }
    }

    /// Load the initial sequencer image from a file.
    ///
    /// Does nothing if the profile disabled the sequencer.
    pub fn load_image<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        if !self.ctx.radio_seq_en {
            debug!("radio sequencer disabled by profile, not loading image");
            return Ok(());
        }
        let data = std::fs::read(path)?;
        self.load_image_bytes(&data)
    }

    /// Load the initial sequencer image from memory.
    ///
    /// The image is checked completely before anything is written. The
    /// program goes in first, then the lookup table is pushed to the
    /// co-processor and the crossbar is programmed.
    pub fn load_image_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        if !self.ctx.radio_seq_en {
            debug!("radio sequencer disabled by profile, not loading image");
            return Ok(());
        }
        let image = RsImage::parse(data)?;
        self.write_program(&image)?;
        self.push_lookup_table(&image)?;
        self.write_xbar(&image.xbar)?;
        self.ctx.image = Some(RsImageInfo::from(&image));
        self.ctx.started = false;
        self.ctx.running = false;
        self.set_state(SequencerState::LoadedIdle);
        Ok(())
    }

    /// Release the sequencers onto the startup pattern. The radio stays off
    /// until [`radio_start`](Self::radio_start).
    ///
    /// Does nothing if they're already started.
    ///
    /// # Errors
    ///
    /// [`Error::State`] if no image is loaded, [`Error::Timeout`] if the
    /// frame-timing sequencers never reach the startup pattern.
    pub fn start(&mut self) -> Result<(), Error> {
        let startup = {
            let img = self.loaded()?;
            img.lookup_table
                .get(RS_STARTUP_PATTERN_ID)
                .copied()
                .ok_or(Error::State("sequencer image has no startup pattern"))?
        };
        if self.ctx.started {
            return Ok(());
        }
        for ch in 0..RS_NUM_SEQUENCERS {
            modify_u32(&mut *self.hal, cfg0(ch), RS_RESET_HOLD_BIT, 0)?;
            self.hal
                .write_u32(chan_reg(ch, RS_POINTER_INIT_OFFSET), startup >> 4)?;
        }
        self.hal.write_u32(RS_APPLY_NOW, 1)?;
        let target = (startup >> 4 << 4) & RS_PC_MASK;
        poll::RS_START.poll(&mut *self.hal, "sequencers at startup pattern", |h| {
            for seq in 0..RS_NUM_FRAME_TIMING_SEQUENCERS {
                if h.read_u32(RS_SEQ_PC_BASE + seq * 4)? & RS_PC_MASK != target {
                    return Ok(None);
                }
            }
            Ok(Some(()))
        })?;
        self.ctx.started = true;
        debug!("radio sequencers released onto the startup pattern");
        Ok(())
    }

    /// Turn the radio off (RadioStop).
    pub fn stop(&mut self) -> Result<(), Error> {
        Mailbox::new(&mut *self.hal).exec(OPCODE_RADIO_OFF, &[])?;
        self.ctx.running = false;
        if self.ctx.image.is_some() {
            self.set_state(SequencerState::LoadedIdle);
        }
        Ok(())
    }

    /// Turn the radio on (RadioStart).
    ///
    /// # Errors
    ///
    /// [`Error::State`] unless [`start`](Self::start) has run since the
    /// last load.
    pub fn radio_start(&mut self) -> Result<(), Error> {
        if !self.ctx.started {
            return Err(Error::State("radio sequencer not started"));
        }
        Mailbox::new(&mut *self.hal).exec(OPCODE_RADIO_ON, &[])?;
        self.ctx.running = true;
        self.set_state(SequencerState::Running);
        Ok(())
    }

    /// Swap in a new sequencer image from a file. See
    /// [`reload_bytes`](Self::reload_bytes).
    pub fn reload<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        if !self.ctx.radio_seq_en {
            debug!("radio sequencer disabled by profile, not reloading");
            return Ok(());
        }
        let data = std::fs::read(path)?;
        self.reload_bytes(&data)
    }

    /// Swap in a new sequencer image while the device is up.
    ///
    /// The new image is checked before the hardware is touched. Then:
    ///
    /// 1. If the radio is on, RadioStop, and wait for every frame-timing
    ///    sequencer to park on the null pattern.
    /// 2. Hold all sequencers in reset and wait for them to get there.
    /// 3. Write the new program.
    /// 4. Push the new lookup table to the co-processor.
    /// 5. Re-apply the crossbar, and reset the external jump and
    ///    general-purpose registers.
    /// 6. If the radio was on, start the sequencers and RadioStart again.
    ///
    /// # Errors
    ///
    /// Timeouts and a rejected lookup table need a device reset. A failure
    /// part-way leaves the sequencers in whatever state they reached.
    pub fn reload_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        if !self.ctx.radio_seq_en {
            debug!("radio sequencer disabled by profile, not reloading");
            return Ok(());
        }
        let image = RsImage::parse(data)?;
        let null_pattern = self
            .loaded()?
            .lookup_table
            .get(RS_NULL_PATTERN_ID)
            .copied()
            .ok_or(Error::State("sequencer image has no null pattern"))?;
        let was_running = self.ctx.running;
        info!("reloading radio sequencer (radio on: {was_running})");

        if was_running {
            self.set_state(SequencerState::Stopping);
            Mailbox::new(&mut *self.hal).exec(OPCODE_RADIO_OFF, &[])?;
            self.ctx.running = false;
            let park = null_pattern & RS_PC_MASK;
            poll::RS_PARK.poll(&mut *self.hal, "sequencers parked", |h| {
                for seq in 0..RS_NUM_FRAME_TIMING_SEQUENCERS {
                    if h.read_u32(RS_SEQ_PC_BASE + seq * 4)? & RS_PC_MASK != park {
                        return Ok(None);
                    }
                }
                Ok(Some(()))
            })?;
        }

        self.set_state(SequencerState::Reloading);
        for ch in 0..RS_NUM_SEQUENCERS {
            modify_u32(&mut *self.hal, cfg0(ch), RS_RESET_HOLD_BIT, RS_RESET_HOLD_BIT)?;
        }
        self.hal.write_u32(RS_APPLY_NOW, 1)?;
        poll::RS_RESET.poll(&mut *self.hal, "sequencers in reset", |h| {
            for ch in 0..RS_NUM_SEQUENCERS {
                let dbg = h.read_u32(chan_reg(ch, RS_DBG_STATE_OFFSET))? & RS_DBG_STATE_MASK;
                if dbg != RS_DBG_STATE_RESET {
                    return Ok(None);
                }
            }
            Ok(Some(()))
        })?;

        self.write_program(&image)?;
        self.ctx.image = Some(RsImageInfo::from(&image));
        self.push_lookup_table(&image)?;

        self.write_xbar(&image.xbar)?;
        for ch in 0..RS_NUM_SEQUENCERS {
            self.hal
                .write_u32(chan_reg(ch, RS_EXT_JUMP_OFFSET), RS_EXT_JUMP_RESET_POINTER)?;
            for n in 0..RS_NUM_GPRS {
                self.hal
                    .write_u32(RS_GPR_BASE + ch * RS_CHAN_STRIDE + n * 4, 0)?;
            }
        }
        self.hal.write_u32(RS_APPLY_NOW, 1)?;

        self.ctx.started = false;
        self.set_state(SequencerState::LoadedIdle);
        if was_running {
            self.start()?;
            self.radio_start()?;
        }
        Ok(())
    }

    fn write_program(&mut self, image: &RsImage) -> Result<(), Error> {
        let mut stream = StreamingGuard::enter(&mut *self.hal)?;
        let r = write_chunked(
            &mut *stream,
            RS_PROGRAM_ADDR,
            &image.program,
            RS_IMAGE_LOAD_CHUNK_SIZE,
            None::<fn(usize, usize)>,
        );
        keep_first(r, stream.finish())?;
        debug!("radio sequencer program written, {} bytes", image.program.len());
        Ok(())
    }

    fn push_lookup_table(&mut self, image: &RsImage) -> Result<(), Error> {
        let mut w = ByteWriter::with_capacity(8 + image.lookup_table.len() * 4);
        w.u32(image.lookup_table.len() as u32).u32(image.lookup_crc);
        for addr in &image.lookup_table {
            w.u32(*addr);
        }
        let mut mb = Mailbox::new(&mut *self.hal);
        mb.mem_write(MAILBOX_SET, w.as_slice())?;
        match mb.exec(OPCODE_SET, &[OBJID_RS_CTRL, RS_CTRL_LOOKUP_TABLE]) {
            Err(Error::Firmware { status, .. }) => Err(Error::LookupTableRejected { status }),
            other => other,
        }
    }

    fn write_xbar(&mut self, xbar: &[u8]) -> Result<(), Error> {
        for (i, b) in xbar.iter().enumerate() {
            self.hal.write_u8(RS_XBAR_BASE + i as u32, *b)?;
        }
        Ok(())
    }
}
