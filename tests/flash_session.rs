use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use bfflash::build_info::BuildInfo;
use bfflash::dfu::DfuBackend;
use bfflash::firmware::PatchOutcome;
use bfflash::flasher::{DefaultsOutcome, FlashOutcome};
use bfflash::packets;
use bfflash::serial::SerialPorts;
use bfflash::{Error, FirmwareImage, FlashOptions, Flasher, MspCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

const PORT: &str = "/dev/ttyACM0";

#[derive(Default)]
struct ScriptedDfu {
    present_after: u32,
    polls: u32,
    fail: bool,
    downloads: Vec<(Vec<u8>, u32)>,
}

impl DfuBackend for ScriptedDfu {
    fn is_present(&mut self) -> bfflash::Result<bool> {
        self.polls += 1;
        Ok(self.polls > self.present_after)
    }

    fn download(&mut self, image: &[u8], address: u32) -> bfflash::Result<()> {
        if self.fail {
            return Err(Error::Transfer("stall".into()));
        }
        self.downloads.push((image.to_vec(), address));
        Ok(())
    }
}

struct ScriptedPorts {
    streams: Mutex<VecDeque<DuplexStream>>,
}

impl SerialPorts for ScriptedPorts {
    type Port = DuplexStream;

    fn available(&self) -> bfflash::Result<Vec<String>> {
        Ok(vec![PORT.to_string()])
    }

    fn open(&self, _name: &str, _baud_rate: u32) -> bfflash::Result<DuplexStream> {
        self.streams.lock().unwrap().pop_front().ok_or_else(|| Error::Io(std::io::ErrorKind::NotFound.into()))
    }
}

fn options() -> FlashOptions {
    FlashOptions {
        poll_attempts: 3,
        poll_interval: Duration::from_millis(1),
        settle_delay: Duration::from_millis(1),
        request_timeout: Duration::from_millis(500),
        ack_timeout: Duration::from_millis(100),
        ..FlashOptions::default()
    }
}

fn response(code: MspCode, payload: &[u8]) -> Vec<u8> {
    let mut raw = packets::encode(code.code(), payload);
    raw[2] = b'>';
    raw
}

fn board_info(capabilities: u8) -> Vec<u8> {
    let mut payload = b"S7X2".to_vec();
    payload.extend_from_slice(&1u16.to_le_bytes());
    payload.push(2);
    payload.push(capabilities);
    for field in ["SPEEDYBEEF7V3", "SPEEDYBEEF7V3", "SPBE"] {
        payload.push(field.len() as u8);
        payload.extend_from_slice(field.as_bytes());
    }
    payload.extend_from_slice(&[0; 32]);
    payload.push(9);
    payload.push(0);
    payload.extend_from_slice(&8000u16.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload
}

// Answers MSP requests like a freshly flashed flight controller on API 1.43
// and returns every request received as (code, payload).
async fn scripted_device(mut stream: DuplexStream, capabilities: u8) -> Vec<(u8, Vec<u8>)> {
    let mut requests = Vec::new();
    loop {
        let mut header = [0u8; 5];
        if stream.read_exact(&mut header).await.is_err() {
            return requests;
        }
        assert_eq!(&header[..3], b"$M<");
        let (len, code) = (header[3] as usize, header[4]);
        let mut rest = vec![0u8; len + 1];
        stream.read_exact(&mut rest).await.unwrap();
        rest.pop();
        requests.push((code, rest));

        let reply = match MspCode::try_from(code).unwrap() {
            MspCode::ApiVersion => response(MspCode::ApiVersion, &[0, 1, 43]),
            MspCode::FcVariant => response(MspCode::FcVariant, b"BTFL"),
            MspCode::FcVersion => response(MspCode::FcVersion, &[4, 5, 1]),
            MspCode::BuildInfo => response(MspCode::BuildInfo, b"Oct 16 202612:00:00abcdef"),
            MspCode::BoardInfo => response(MspCode::BoardInfo, &board_info(capabilities)),
            MspCode::ResetConf => response(MspCode::ResetConf, &[]),
            other => panic!("unexpected request {other}"),
        };
        if stream.write_all(&reply).await.is_err() {
            return requests;
        }
    }
}

fn image() -> FirmwareImage {
    let mut image = FirmwareImage::new();
    for (i, byte) in [0x00, 0x20, 0x01, 0x20].into_iter().enumerate() {
        image.set(0x0800_0000 + i as u32, byte);
    }
    image.set(0x0800_2800, 0xAA);
    image.set(0x0800_2900, 0xBB);
    image
}

#[tokio::test]
async fn full_session_flashes_and_applies_custom_defaults() {
    let (cli_host, mut cli_device) = duplex(64);
    let (msp_host, msp_device) = duplex(1024);
    let ports = ScriptedPorts { streams: Mutex::new(VecDeque::from([cli_host, msp_host])) };
    let device = tokio::spawn(scripted_device(msp_device, 0b0011_0000));

    let build_info = BuildInfo { configuration: Some(vec!["set a = 1".into()]), ..Default::default() };
    let dfu = ScriptedDfu { present_after: 1, ..Default::default() };
    let mut flasher = Flasher::new(dfu, ports, PORT, options());
    let report = flasher.run(image(), &build_info).await.unwrap();

    let mut cli = Vec::new();
    cli_device.read_to_end(&mut cli).await.unwrap();
    assert_eq!(cli, b"#\nbl\n");

    assert_eq!(report.patch, PatchOutcome::Patched { start: 0x0800_2801, len: 23 });
    assert_eq!(report.flash, FlashOutcome::Flashed);
    let (binary, origin) = &flasher.dfu().downloads[0];
    assert_eq!(*origin, 0x0800_0000);
    assert_eq!(&binary[0x2801..0x2801 + 23], b"# Betaflight\nset a = 1\0");
    assert_eq!(binary[0x2801 + 23], 0xFF);

    assert_eq!(report.device.flight_controller_identifier, "BTFL");
    assert_eq!(report.device.flight_controller_version, "4.5.1");
    assert_eq!(report.device.build_info, "Oct 16 2026 12:00:00");
    assert_eq!(report.device.board_name, "SPEEDYBEEF7V3");
    assert_eq!(report.device.sample_rate_hz, 8000);
    assert_eq!(report.defaults, DefaultsOutcome::Applied { acknowledged: true });

    drop(flasher);
    let requests = device.await.unwrap();
    let codes: Vec<u8> = requests.iter().map(|(code, _)| *code).collect();
    assert_eq!(codes, [1, 2, 3, 5, 4, 208]);
    assert_eq!(requests[5].1, [1]);
}

#[tokio::test]
async fn device_without_custom_defaults_is_left_alone() {
    let (msp_host, msp_device) = duplex(1024);
    let ports = ScriptedPorts { streams: Mutex::new(VecDeque::from([msp_host])) };
    let device = tokio::spawn(scripted_device(msp_device, 0b0001_0000));

    let mut flasher = Flasher::new(ScriptedDfu::default(), ports, PORT, options());
    let report = flasher.run(image(), &BuildInfo::default()).await.unwrap();

    assert_eq!(report.patch, PatchOutcome::NoConfiguration);
    assert_eq!(report.defaults, DefaultsOutcome::NotSupported);
    drop(flasher);
    let codes: Vec<u8> = device.await.unwrap().into_iter().map(|(code, _)| code).collect();
    assert_eq!(codes, [1, 2, 3, 5, 4]);
}

#[tokio::test]
async fn missing_dfu_device_aborts_before_flashing() {
    let (cli_host, _cli_device) = duplex(64);
    let ports = ScriptedPorts { streams: Mutex::new(VecDeque::from([cli_host])) };
    let dfu = ScriptedDfu { present_after: u32::MAX, ..Default::default() };

    let mut flasher = Flasher::new(dfu, ports, PORT, options());
    let err = flasher.run(image(), &BuildInfo::default()).await.unwrap_err();

    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::DeviceAbsent { attempts: 3, .. })));
    assert!(flasher.dfu().downloads.is_empty());
}

#[tokio::test]
async fn failed_transfer_still_reaches_custom_defaults() {
    let (msp_host, msp_device) = duplex(1024);
    let ports = ScriptedPorts { streams: Mutex::new(VecDeque::from([msp_host])) };
    let device = tokio::spawn(scripted_device(msp_device, 0b0011_0000));
    let dfu = ScriptedDfu { fail: true, ..Default::default() };

    let mut flasher = Flasher::new(dfu, ports, PORT, options());
    let report = flasher.run(image(), &BuildInfo::default()).await.unwrap();

    assert!(matches!(&report.flash, FlashOutcome::Failed(msg) if msg.contains("stall")));
    assert!(flasher.dfu().downloads.is_empty());
    assert_eq!(report.defaults, DefaultsOutcome::Applied { acknowledged: true });
    drop(flasher);
    let codes: Vec<u8> = device.await.unwrap().into_iter().map(|(code, _)| code).collect();
    assert_eq!(codes, [1, 2, 3, 5, 4, 208]);
}
