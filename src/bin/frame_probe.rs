//! Writes a worker request for an image file to stdout.
//!
//! ```text
//! frame-probe photo.jpg --ping | landmark-worker --task hand
//! frame-probe photo.jpg --framing lines --crop-info 0.25 0.25 0.5 0.5 | landmark-worker --task pose --framing lines
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::Parser;
use serde_json::{json, Map, Value};

use landmark_worker::protocol::{encode_binary_message, Framing};

#[derive(Parser, Debug)]
#[command(about = "Encode an image as a landmark-worker request")]
struct Args {
    /// Encoded image (PNG, JPEG, ...)
    image: PathBuf,

    #[arg(long, value_enum, default_value_t = Framing::Binary)]
    framing: Framing,

    /// Send a ping before the frame
    #[arg(long)]
    ping: bool,

    /// Crop and remap results to frame coordinates
    #[arg(long, num_args = 4, value_names = ["OFFSET_X", "OFFSET_Y", "SCALE_X", "SCALE_Y"])]
    crop_info: Option<Vec<f64>>,

    /// Crop and keep results in crop coordinates
    #[arg(long, num_args = 4, value_names = ["OFFSET_X", "OFFSET_Y", "SCALE_X", "SCALE_Y"])]
    roi_info: Option<Vec<f64>>,

    /// Number of times to send the frame
    #[arg(long, default_value_t = 1)]
    repeat: usize,
}

fn descriptor(values: &[f64]) -> Value {
    json!({
        "offsetX": values[0],
        "offsetY": values[1],
        "scaleX": values[2],
        "scaleY": values[3],
    })
}

fn write_request(out: &mut impl Write, framing: Framing, header: &Value, payload: Option<&[u8]>) -> Result<()> {
    match framing {
        Framing::Binary => out.write_all(&encode_binary_message(header, payload)?)?,
        Framing::Lines => writeln!(out, "{}", serde_json::to_string(header)?)?,
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let image = std::fs::read(&args.image)
        .with_context(|| format!("failed to read {}", args.image.display()))?;

    let mut header = Map::new();
    header.insert("type".into(), json!("process_frame"));
    let payload = match args.framing {
        Framing::Binary => {
            header.insert("format".into(), json!("binary"));
            header.insert("data_length".into(), json!(image.len()));
            Some(image.as_slice())
        }
        Framing::Lines => {
            header.insert("format".into(), json!("base64"));
            header.insert("image_data".into(), json!(BASE64.encode(&image)));
            None
        }
    };
    if let Some(values) = &args.crop_info {
        header.insert("crop_info".into(), descriptor(values));
    }
    if let Some(values) = &args.roi_info {
        header.insert("roi_info".into(), descriptor(values));
    }
    let header = Value::Object(header);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if args.ping {
        write_request(&mut out, args.framing, &json!({"type": "ping"}), None)?;
    }
    for _ in 0..args.repeat {
        write_request(&mut out, args.framing, &header, payload)?;
    }
    out.flush()?;
    eprintln!(
        "{} request(s) for {} ({} bytes)",
        args.repeat + args.ping as usize,
        args.image.display(),
        image.len()
    );
    Ok(())
}
