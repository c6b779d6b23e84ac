use clap::Parser;
use log::{debug, info, warn};
use miette::{miette, IntoDiagnostic, Result};
use serde_json::json;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use camreplay_core::message::BYTES_PER_PIXEL;
use camreplay_core::{MetadataRecord, NalScanner, ReplayMessage};
use camreplay_host::config::{check_record_config, default_recordings_dir, RecordConfig};
use camreplay_host::recording::{
    find_recording_set, start_recording, start_replay, BytePlayer, CapturedItem, Mp4Reader,
    MuxerConfig, RecordedSession, RecordingManager, RecordingTarget, ReplayOptions, TrackCodec,
    VideoCodec,
};
use camreplay_host::{Cli, Command, MatchArgs, RecordArgs, ReplayArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .format_timestamp_millis()
        .init();
    debug!("camreplay {}", camreplay_host::VERSION);

    match args.command {
        Command::Record(args) => record(args).await,
        Command::Replay(args) => replay(args).await,
        Command::List { dir } => list(dir),
        Command::Match(args) => find_match(args),
        Command::Export { input, output } => export(&input, &output),
    }
}

async fn record(args: RecordArgs) -> Result<()> {
    let config = match &args.output {
        Some(path) => check_record_config(path)
            .ok_or_else(|| miette!("Recording disabled: {} is not usable", path.display()))?,
        None => {
            let dir = default_recordings_dir();
            fs::create_dir_all(&dir).into_diagnostic()?;
            RecordConfig::new(dir)
        }
    };
    let encoding = &config.video_encoding;
    let codec = args.codec.unwrap_or(encoding.codec);
    let fps = args.fps.unwrap_or(encoding.fps);

    let stem = format!("{}-{}", args.device_id, args.node);
    let target = RecordingTarget {
        video_path: encoding
            .enabled
            .then(|| config.output_dir.join(format!("{}.mp4", stem))),
        metadata_path: args
            .metadata
            .as_ref()
            .map(|_| config.output_dir.join(format!("{}.meta", stem))),
        width: args.width,
        height: args.height,
        fps,
        codec,
    };
    if target.video_path.is_none() && target.metadata_path.is_none() {
        return Err(miette!("Video encoding is disabled and no metadata was given"));
    }

    let (tx, rx) = mpsc::channel(32);
    let active = start_recording(target.clone(), MuxerConfig::default(), rx).into_diagnostic()?;

    if target.video_path.is_some() {
        for payload in read_payloads(&args.input, codec, args.width, args.height)? {
            if tx.send(CapturedItem::Video(payload)).await.is_err() {
                warn!("Recording ended early, remaining video dropped");
                break;
            }
        }
    }

    if let Some(path) = &args.metadata {
        let mut player = BytePlayer::init(path).into_diagnostic()?;
        while let Some(value) = player.next().into_diagnostic()? {
            let record = MetadataRecord::from_value(value).into_diagnostic()?;
            if tx.send(CapturedItem::Record(record)).await.is_err() {
                warn!("Recording ended early, remaining metadata dropped");
                break;
            }
        }
    }

    drop(tx);
    let status = active.finish().await;
    println!("{}", serde_json::to_string_pretty(&status).into_diagnostic()?);
    Ok(())
}

/// Split an input into the payloads a live pipeline would have produced
fn read_payloads(input: &Path, codec: VideoCodec, width: u32, height: u32) -> Result<Vec<Vec<u8>>> {
    match codec {
        VideoCodec::H264 => {
            let data = fs::read(input).into_diagnostic()?;
            Ok(NalScanner::new(&data)
                .map(|nal| nal.with_start_code().to_vec())
                .collect())
        }
        VideoCodec::Mjpeg => {
            let mut images: Vec<PathBuf> = fs::read_dir(input)
                .into_diagnostic()?
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| {
                    path.extension()
                        .is_some_and(|ext| ext == "jpg" || ext == "jpeg")
                })
                .collect();
            images.sort();
            images
                .iter()
                .map(|path| fs::read(path).into_diagnostic())
                .collect()
        }
        VideoCodec::Raw => {
            let frame_len = width as usize * height as usize * BYTES_PER_PIXEL;
            if frame_len == 0 {
                return Err(miette!("Invalid frame size {}x{}", width, height));
            }
            let data = fs::read(input).into_diagnostic()?;
            let chunks = data.chunks_exact(frame_len);
            if !chunks.remainder().is_empty() {
                warn!("Ignoring {} trailing bytes", chunks.remainder().len());
            }
            Ok(chunks.map(<[u8]>::to_vec).collect())
        }
    }
}

async fn replay(args: ReplayArgs) -> Result<()> {
    let sources: Vec<(String, Option<PathBuf>, Option<PathBuf>)> = match &args.dir {
        Some(dir) => {
            if args.nodes.is_empty() {
                return Err(miette!("--node is required with --dir"));
            }
            let set = find_recording_set(dir, &args.device_ids, &args.nodes)
                .into_diagnostic()?
                .ok_or_else(|| miette!("No recording in {} matches", dir.display()))?;
            set.streams
                .into_iter()
                .map(|s| (s.node_name, s.video, s.metadata))
                .collect()
        }
        None => vec![("replay".to_string(), args.video, args.metadata)],
    };

    let options = ReplayOptions {
        channel_capacity: args.buffer,
    };
    let mut printers = Vec::new();
    for (node, video, metadata) in sources {
        let session = RecordedSession::open(video.as_deref(), metadata.as_deref())
            .map_err(|e| miette!("{}: {}", node, e))?;
        let (active, mut messages) = start_replay(session, options);
        printers.push(tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                println!("{}", describe(&node, &message));
            }
            (node, active.wait().await)
        }));
    }

    let mut failed = false;
    for printer in printers {
        let (node, result) = printer.await.into_diagnostic()?;
        match result {
            Ok(state) => info!(
                "{}: {} messages, {} ticks (video eos: {}, metadata eos: {})",
                node, state.emitted, state.tick, state.video_eos, state.metadata_eos
            ),
            Err(e) => {
                eprintln!("{}: {}", node, e);
                failed = true;
            }
        }
    }
    if failed {
        return Err(miette!("Replay failed"));
    }
    Ok(())
}

fn describe(node: &str, message: &ReplayMessage) -> String {
    let value = match message {
        ReplayMessage::Image(frame) => json!({
            "node": node,
            "type": "image",
            "sequence": frame.sequence_num,
            "instance": frame.instance_num,
            "width": frame.width,
            "height": frame.height,
            "timestampUs": frame.timestamp.as_micros() as u64,
            "bytes": frame.data().len(),
        }),
        ReplayMessage::Imu(imu) => json!({
            "node": node,
            "type": "imu",
            "packets": imu.packets.iter().map(|p| json!({
                "accelerometer": [p.accelerometer.x, p.accelerometer.y, p.accelerometer.z],
                "rollPitchYaw": [p.gyroscope.x, p.gyroscope.y, p.gyroscope.z],
            })).collect::<Vec<_>>(),
        }),
    };
    value.to_string()
}

fn list(dir: Option<PathBuf>) -> Result<()> {
    let manager = match dir {
        Some(dir) => RecordingManager::with_base_dir(dir),
        None => RecordingManager::new(),
    };
    let recordings = manager.list_recordings();
    info!(
        "{} recordings in {}",
        recordings.len(),
        manager.base_dir().display()
    );
    println!("{}", serde_json::to_string_pretty(&recordings).into_diagnostic()?);
    Ok(())
}

fn find_match(args: MatchArgs) -> Result<()> {
    let set = find_recording_set(&args.dir, &args.device_ids, &args.nodes).into_diagnostic()?;
    let Some(set) = set else {
        return Err(miette!("No recording set matches nodes {:?}", args.nodes));
    };
    let streams: Vec<_> = set
        .streams
        .iter()
        .map(|s| json!({"node": s.node_name, "video": s.video, "metadata": s.metadata}))
        .collect();
    let value = json!({"deviceId": set.device_id, "streams": streams});
    println!("{}", serde_json::to_string_pretty(&value).into_diagnostic()?);
    Ok(())
}

fn export(input: &Path, output: &str) -> Result<()> {
    let file = File::open(input).into_diagnostic()?;
    let mut reader = Mp4Reader::open(BufReader::new(file)).into_diagnostic()?;
    if reader.track().codec != TrackCodec::Avc1 {
        return Err(miette!(
            "{} holds a {} track, only H.264 exports to Annex-B",
            input.display(),
            reader.track().codec
        ));
    }

    let sink: Box<dyn Write> = if output == "-" {
        Box::new(std::io::stdout().lock())
    } else {
        Box::new(File::create(output).into_diagnostic()?)
    };
    let mut sink = BufWriter::new(sink);
    let mut samples = 0usize;
    for sample in reader.annex_b_samples() {
        sink.write_all(&sample.into_diagnostic()?).into_diagnostic()?;
        samples += 1;
    }
    sink.flush().into_diagnostic()?;
    info!("Exported {} samples from {}", samples, input.display());
    Ok(())
}
