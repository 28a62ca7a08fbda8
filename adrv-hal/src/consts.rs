//! Register addresses, memory windows, opcodes and object IDs.
//!
//! Register addresses are SPI-direct; memory addresses are on the AHB bus and
//! reached through the same [`Hal`][crate::hal::Hal] accessors.

#![allow(missing_docs)]

// Identification
pub const REG_PRODUCT_ID: u32 = 0x0003;
pub const REG_SILICON_REV: u32 = 0x0004;

// Main CPU command interface
pub const REG_CPU_COMMAND: u32 = 0x00C3;
pub const CPU_COMMAND_BUSY: u8 = 0x80;
pub const REG_CPU_EXT_CMD: u32 = 0x00C4;
pub const CPU_MAX_EXT_BYTES: usize = 4;
pub const REG_CPU_CMD_STATUS: u32 = 0x00D0;
pub const CMD_STATUS_PENDING: u8 = 0x01;
pub const CMD_STATUS_ERROR: u8 = 0x0E;
pub const REG_CPU0_EXCEPTION: u32 = 0x00E0;
pub const REG_CPU1_EXCEPTION: u32 = 0x00E4;
pub const REG_CPU_FORCE_EXCEPTION: u32 = 0x00EC;
pub const CPU_FORCE_EXCEPTION_CMD: u8 = 0x01;
pub const REG_DFE_BOOT_STATUS: u32 = 0x00F0;
pub const DFE_BOOT_STATUS_EXCEPTION_DONE: u8 = 0x0F;
pub const REG_TX_SLICE_CLK_EN: u32 = 0x0110;

// Mailbox windows
pub const MAILBOX_SET: u32 = 0x2002_8000;
pub const MAILBOX_GET: u32 = 0x2002_8800;
pub const MAILBOX_WINDOW_SIZE: usize = 0x800;

// Opcodes
pub const OPCODE_RADIO_OFF: u8 = 0x00;
pub const OPCODE_RADIO_ON: u8 = 0x04;
pub const OPCODE_SET: u8 = 0x0A;
pub const OPCODE_GET: u8 = 0x0C;
pub const OPCODE_MAX: u8 = 30;

// Object IDs
pub const OBJID_CAL_STATUS: u8 = 0x01;
pub const OBJID_TRACKING_CAL_CTRL: u8 = 0x02;
pub const OBJID_CONFIG: u8 = 0x03;
pub const OBJID_RS_CTRL: u8 = 0x04;
pub const OBJID_DPD_TRACKING: u8 = 0x40;
pub const OBJID_CLGC_TRACKING: u8 = 0x41;
pub const OBJID_CFR_INIT: u8 = 0x42;

// CPU images
pub const CPU_ARCHIVE_MAGIC: u32 = 0x4350_5541;
pub const CPU_ARCHIVE_FORMAT_REV: u32 = 1;
pub const CPU_ARCHIVE_HEADER_SIZE: usize = 12;
pub const CPU0_PROGRAM_ADDR: u32 = 0x0100_0000;
pub const CPU0_IMAGE_SIZE: usize = 0x2_0000;
pub const CPU1_PROGRAM_ADDR: u32 = 0x0200_0000;
pub const CPU1_IMAGE_SIZE: usize = 0x1_0000;
pub const IMAGE_LOAD_CHUNK_SIZE: usize = 4096;

// Stream processor
pub const STREAM_IMAGE_ADDR: u32 = 0x4600_0000;
pub const STREAM_IMAGE_MAX_SIZE: usize = 0x8000;

// Radio sequencer
pub const RS_NUM_SEQUENCERS: u32 = 16;
pub const RS_NUM_FRAME_TIMING_SEQUENCERS: u32 = 10;
pub const RS_NUM_GPRS: u32 = 16;
pub const RS_CHAN_BASE: u32 = 0x4720_0000;
pub const RS_CHAN_STRIDE: u32 = 0x40;
pub const RS_CFG0_OFFSET: u32 = 0x00;
pub const RS_RESET_HOLD_BIT: u32 = 1 << 28;
pub const RS_DBG_STATE_OFFSET: u32 = 0x04;
pub const RS_DBG_STATE_MASK: u32 = 0xF;
pub const RS_DBG_STATE_RESET: u32 = 0x4;
pub const RS_DBG_STATE_RUN: u32 = 0x1;
pub const RS_EXT_JUMP_OFFSET: u32 = 0x08;
pub const RS_EXT_JUMP_RESET_POINTER: u32 = 0xFFF0;
pub const RS_POINTER_INIT_OFFSET: u32 = 0x0C;
pub const RS_GPR_BASE: u32 = 0x4722_0000;
pub const RS_XBAR_BASE: u32 = 0x4721_0000;
pub const RS_XBAR_SIZE: usize = 64;
pub const RS_APPLY_NOW: u32 = 0x4721_0100;
pub const RS_SEQ_PC_BASE: u32 = 0x4721_0200;
pub const RS_PC_MASK: u32 = 0xFFFF;
pub const RS_PROGRAM_ADDR: u32 = 0x4740_0000;
pub const RS_IMAGE_MAX_SIZE: usize = 0x1_0000;
pub const RS_IMAGE_LOAD_CHUNK_SIZE: usize = 256;
pub const RS_IMAGE_HEADER_SIZE: usize = 8 + RS_XBAR_SIZE;
pub const RS_MAX_PATTERNS: usize = 256;
pub const RS_NULL_PATTERN_ID: usize = 0;
pub const RS_STARTUP_PATTERN_ID: usize = 1;
pub const RS_CTRL_LOOKUP_TABLE: u8 = 0x01;

// Rx gain tables
pub const RX_GAIN_TABLE_BASE: u32 = 0x4730_0000;
pub const RX_GAIN_TABLE_STRIDE: u32 = 0x1000;
pub const RX_GAIN_TABLE_ENTRY_SIZE: u32 = 8;
pub const RX_GAIN_TABLE_MAX_ROWS: usize = 256;

// CFR
pub const ADDR_CFR_PULSE: u32 = 0x2002_F000;
pub const CFR_PULSE_RAM_STRIDE: u32 = 2048;
pub const CFR_MAX_PULSE_LEN: usize = 512;
pub const CFR_MAX_HALF_PULSE_LEN: usize = 256;
pub const CFR_NUM_ENGINES: usize = 3;

// DPD
pub const DPD_MAX_FEATURES: usize = 190;
pub const DPD_FEATURES_PER_CHUNK: usize = 20;
pub const DPD_FEATURE_SIZE: usize = 12;
pub const DPD_MODEL_METADATA_SIZE: usize = 4;
pub const DPD_STATUS_SIZE: usize = 112;

// CLGC
pub const CLGC_CONFIG_SIZE: usize = 52;
pub const CLGC_CONFIG_STRIDE: u16 = 56;
pub const CLGC_STATUS_SIZE: usize = 140;

// Channels
pub const NUM_TX_CHANNELS: usize = 8;
pub const NUM_RX_CHANNELS: usize = 8;
pub const NUM_ORX_CHANNELS: usize = 2;
pub const NUM_PROFILE_CHANNELS: usize = 8;
pub const CHAN_DISABLED: u8 = 255;
pub const JESD_IQ_RATE_KHZ: u32 = 491_520;

// Memory dump
pub const MEM_DUMP_CHUNK_SIZE: usize = 256;
pub const SPI_ONLY_REGS_ADDR: u32 = 0x4700_0000;
pub const SPI_ONLY_REGS_SIZE: u32 = 0x4000;
pub const HW_SEMAPHORE_ADDR: u32 = 0x4650_0000;
pub const HW_SEMAPHORE_SIZE: u32 = 0x20_0000;
pub const STREAM_CPU_RAM_ADDR: u32 = 0x46A0_0000;
pub const FW_VERSION_ADDR: [u32; 3] = [0x0101_FF00, 0x0201_FF00, 0x4600_7F00];
pub const FW_VERSION_SIZE: usize = 16;
pub const ETM_ENABLE_REGS: [u32; 3] = [0x2400_1000, 0x2400_2000, 0x2400_3000];
pub const ETM_ENABLE_BIT: u32 = 0x1;
pub const ETM_TRACE_BUFFER_ADDR: u32 = 0x2410_0000;
pub const ETM_TRACE_BUFFER_SIZE: u32 = 0x1000;

/// Default CPU RAM regions as inclusive `(start, end)` pairs.
pub const DUMP_CPU_RAM_REGIONS: [(u32, u32); 3] = [
    (0x0100_0000, 0x0101_FFFF),
    (0x0200_0000, 0x0200_FFFF),
    (0x46A0_0000, 0x46A0_7FFF),
];
pub const DUMP_TELEM_REGIONS: [(u32, u32); 1] = [(0x2003_0000, 0x2003_0FFF)];
pub const DUMP_REG_REGIONS: [(u32, u32); 2] = [
    (0x4700_0000, 0x4700_00FF),
    (0x4650_0000, 0x4650_003F),
];
pub const DUMP_DFE_RAM_REGIONS: [(u32, u32); 1] = [(0x2000_0000, 0x2001_FFFF)];
