use clap::{App, Arg};
use log::{debug, error, info, warn, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use rand::prelude::*;
use rand_chacha::ChaCha20Rng;
use std::io::{Read, Write};
use std::net::TcpStream;

use mitmcore::bcdutil::ascii_to_bcd_n;
use mitmcore::frame::{
    decode_frame, encode_frame, Md5Checksum, MessageKind, Wrapper, FRAME_MAGIC, SESSION_ID_LEN,
};

// Visa credit sample: PAN, credit AUC, attended POS, US country and
// currency, CTQ asking for online PIN.
static SAMPLE_TLV_HEX: &str =
    "5A0841111111111111119F0701009F3501215F280208405F2A0208409F6C020040";

fn initialize_logging(level: LevelFilter) {
    let stdout = ConsoleAppender::builder().build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))
        .unwrap();
    let _handle = log4rs::init_config(config).unwrap();
}

fn read_frame(stream: &mut TcpStream) -> Result<Wrapper, String> {
    let mut header = [0u8; 8];
    stream
        .read_exact(&mut header)
        .map_err(|err| format!("read failed: {}", err))?;

    if header[..4] != FRAME_MAGIC[..] {
        return Err(format!("unexpected frame magic {:02X?}", &header[..4]));
    }

    let remainder = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut rest = vec![0u8; remainder];
    stream
        .read_exact(&mut rest)
        .map_err(|err| format!("read failed: {}", err))?;

    let mut frame = header.to_vec();
    frame.extend_from_slice(&rest);

    decode_frame(&frame, &Md5Checksum).map_err(|err| format!("bad frame: {}", err))
}

fn send_frame(stream: &mut TcpStream, wrapper: &Wrapper) -> Result<(), String> {
    let bytes = encode_frame(wrapper, &Md5Checksum);
    stream
        .write_all(&bytes)
        .map_err(|err| format!("write failed: {}", err))
}

fn exchange(stream: &mut TcpStream, wrapper: &Wrapper) -> Result<Wrapper, String> {
    send_frame(stream, wrapper)?;
    read_frame(stream)
}

fn run() -> Result<Option<String>, String> {
    let matches = App::new("relaysim")
        .version("0.1")
        .about("NFC relay client simulator")
        .arg(
            Arg::with_name("connect")
                .long("connect")
                .value_name("HOST:PORT")
                .help("Proxy TCP endpoint, default 127.0.0.1:8081")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("tlv-hex")
                .long("tlv-hex")
                .value_name("HEX")
                .help("TLV buffer to relay instead of the built-in sample card")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("amount")
                .long("amount")
                .value_name("CENTS")
                .help("Append an Amount, Authorised tag (9F02) to the sample")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("count")
                .long("count")
                .value_name("N")
                .help("Number of NFC_DATA frames to send, default 1")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("off|error|warn|info|debug|trace, default info")
                .takes_value(true),
        )
        .get_matches();

    let level = matches
        .value_of("log-level")
        .unwrap_or("info")
        .parse::<LevelFilter>()
        .map_err(|_| "invalid log level".to_string())?;
    initialize_logging(level);

    let endpoint = matches.value_of("connect").unwrap_or("127.0.0.1:8081");
    let count: usize = matches
        .value_of("count")
        .unwrap_or("1")
        .parse()
        .map_err(|_| "invalid count".to_string())?;

    let mut tlv_hex = matches
        .value_of("tlv-hex")
        .unwrap_or(SAMPLE_TLV_HEX)
        .to_uppercase();

    if let Some(amount) = matches.value_of("amount") {
        let bcd = ascii_to_bcd_n(amount.as_bytes(), 6)
            .map_err(|err| format!("invalid amount: {}", err))?;
        tlv_hex.push_str("9F0206");
        tlv_hex.push_str(&hex::encode_upper(bcd));
    }

    // 8 random session id bytes, zero-padded to the 16-byte wire field
    let mut rng = ChaCha20Rng::from_entropy();
    let mut session_id = [0u8; SESSION_ID_LEN];
    rng.fill(&mut session_id[..8]);

    info!("connecting to {}", endpoint);
    let mut stream =
        TcpStream::connect(endpoint).map_err(|err| format!("connect failed: {}", err))?;

    let init = Wrapper::new(
        session_id,
        MessageKind::Init,
        br#"{"device":"relaysim","version":"0.1"}"#.to_vec(),
    );
    let answer = exchange(&mut stream, &init)?;
    if answer.kind != MessageKind::Init {
        warn!("expected INIT echo, got {}", answer.kind);
    }
    info!("session {} established", init.session_hex());

    for seq in 0..count {
        let payload = format!(r#"{{"raw_tlv_hex":"{}","seq":{}}}"#, tlv_hex, seq);
        let request = Wrapper::new(session_id, MessageKind::NfcData, payload.into_bytes());

        let answer = exchange(&mut stream, &request)?;
        match answer.kind {
            MessageKind::NfcData => {
                let body: serde_json::Value = serde_json::from_slice(&answer.payload)
                    .map_err(|err| format!("bad response payload: {}", err))?;
                info!(
                    "frame {}: modified TLV {}",
                    seq,
                    body["modified_tlv_hex"].as_str().unwrap_or("?")
                );
                info!(
                    "frame {}: strategy {} signed={} p={}",
                    seq,
                    body["mitm"]["strategy"]["primary_method"]
                        .as_str()
                        .unwrap_or("?"),
                    body["mitm"]["signature_tag_present"],
                    body["mitm"]["success_probability"]
                );
                debug!("frame {} full response: {}", seq, body);
            }
            MessageKind::Error => {
                warn!(
                    "frame {} rejected: {}",
                    seq,
                    String::from_utf8_lossy(&answer.payload)
                );
            }
            other => warn!("frame {}: unexpected {} response", seq, other),
        }
    }

    let heartbeat = Wrapper::new(session_id, MessageKind::Heartbeat, Vec::new());
    let answer = exchange(&mut stream, &heartbeat)?;
    if answer.kind == MessageKind::Heartbeat {
        info!("heartbeat answered, done");
    }

    Ok(None)
}

fn main() {
    std::process::exit(match run() {
        Ok(None) => 0,
        Ok(msg) => {
            warn!("{:?}", msg);
            0
        }
        Err(err) => {
            error!("{}", err);
            1
        }
    });
}
