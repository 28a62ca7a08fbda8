use adrv_hal::consts::*;
use adrv_hal::sim::SimHal;
use adrv_hal::validate::{cpu_archive_header, CpuArchive};
use adrv_hal::{Device, DeviceState, Error, RecoveryAction, RxChannels};

fn archive() -> Vec<u8> {
    let mut data = cpu_archive_header(CPU_ARCHIVE_MAGIC, CPU_ARCHIVE_FORMAT_REV).to_vec();
    data.resize(CpuArchive::FILE_SIZE, 0x11);
    data
}

fn gain_csv(indices: &[u8]) -> String {
    let mut s = String::from(
        "\"Version\",2,1,0,0\n\"Checksum\",0,0,0,0\n\
         Gain Index,FE Control Word,Ext Control,Phase Offset,Digital Gain\n",
    );
    for (i, idx) in indices.iter().enumerate() {
        s.push_str(&format!("{idx},{},0,0,{}\n", i + 1, -(i as i32)));
    }
    s
}

#[test]
fn short_archive_writes_nothing() -> anyhow::Result<()> {
    let mut data = archive();
    data.truncate(data.len() - 4);
    let mut device = Device::new(SimHal::new());
    let err = device.load_cpu_images_bytes(&data).unwrap_err();
    assert!(matches!(err, Error::FileSize { .. }), "{err}");
    assert_eq!(err.recovery_action(), RecoveryAction::CheckParam);
    assert!(device.hal().ops().is_empty());
    assert!(device.state().is_empty());

    device.load_cpu_images_bytes(&archive())?;
    assert_eq!(device.hal().mem().u8(CPU1_PROGRAM_ADDR + 100), 0x11);
    Ok(())
}

#[test]
fn corrupted_header_checksum() {
    let mut data = archive();
    data[8] ^= 0x01;
    let mut device = Device::new(SimHal::new());
    match device.load_cpu_images_bytes(&data) {
        Err(Error::Checksum { expected, actual, .. }) => assert_ne!(expected, actual),
        other => panic!("unexpected {other:?}"),
    }
    assert!(device.hal().ops().is_empty());

    let mut data = archive();
    data[0..4].copy_from_slice(&cpu_archive_header(0xDEAD_BEEF, 1)[0..4]);
    // Magic changed without fixing the checksum: the checksum is reported.
    assert!(matches!(
        device.load_cpu_images_bytes(&data),
        Err(Error::Checksum { .. })
    ));

    let mut data = archive();
    data[..CPU_ARCHIVE_HEADER_SIZE].copy_from_slice(&cpu_archive_header(0xDEAD_BEEF, 1));
    assert!(matches!(
        device.load_cpu_images_bytes(&data),
        Err(Error::BadMagic { actual: 0xDEAD_BEEF, .. })
    ));
}

#[test]
fn stream_image_limits() -> anyhow::Result<()> {
    let mut device = Device::new(SimHal::new());
    assert!(device.load_stream_image_bytes(&[]).is_err());
    assert!(device.load_stream_image_bytes(&[0; 6]).is_err());
    assert!(device
        .load_stream_image_bytes(&vec![0; STREAM_IMAGE_MAX_SIZE + 4])
        .is_err());
    assert!(device.hal().ops().is_empty());

    device.load_stream_image_bytes(&vec![0x77; STREAM_IMAGE_MAX_SIZE])?;
    assert!(device.state().contains(DeviceState::STREAM_LOADED));
    assert_eq!(
        device.hal().mem().u8(STREAM_IMAGE_ADDR + STREAM_IMAGE_MAX_SIZE as u32 - 1),
        0x77
    );
    Ok(())
}

#[test]
fn gain_table_out_of_order() {
    let mut device = Device::new(SimHal::new());
    let err = device
        .load_rx_gain_table_str(RxChannels::RX0, &gain_csv(&[10, 11, 13]))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::GainTableOrder {
            row: 2,
            expected: 12,
            found: 13
        }
    ));
    assert!(device.hal().ops().is_empty());
    assert_eq!(device.gain_range(0), None);
}

#[test]
fn gain_table_from_file() -> anyhow::Result<()> {
    let path = std::env::temp_dir().join(format!("adrv-hal-gain-{}.csv", std::process::id()));
    std::fs::write(&path, gain_csv(&[0, 1, 2, 3]))?;
    let mut device = Device::new(SimHal::new());
    let r = device.load_rx_gain_table(0xFF, &path);
    std::fs::remove_file(&path)?;
    r?;

    for rx in 0..NUM_RX_CHANNELS {
        assert_eq!(device.gain_range(rx).map(|g| (g.min, g.max)), Some((0, 3)));
        let row3 =
            RX_GAIN_TABLE_BASE + rx as u32 * RX_GAIN_TABLE_STRIDE + 3 * RX_GAIN_TABLE_ENTRY_SIZE;
        assert_eq!(device.hal().mem().u8(row3), 4);
        assert_eq!(device.hal().mem().u8(row3 + 4), (-3i16).to_le_bytes()[0]);
    }
    assert!(device.state().contains(DeviceState::GAIN_TABLE_LOADED));
    Ok(())
}

#[test]
fn missing_file_is_io() {
    let mut device = Device::new(SimHal::new());
    let err = device
        .load_cpu_images("/nonexistent/adrv-hal/cpu_image.bin")
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}
