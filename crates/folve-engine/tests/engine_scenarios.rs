//! End-to-end scenarios over the filesystem facade: header probes, linear
//! streaming, near-EOF seek spam, gapless hand-off, filter switching and
//! pass-through.

use folve_dsp::FrameWriter;
use folve_engine::{FolveFilesystem, FolveOptions, HandlerStatus};
use folve_io::{AudioFileReader, ByteSink, FlacSpec, FlacStreamWriter};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

struct VecSink(Mutex<Vec<u8>>);

struct SharedVecSink(Arc<VecSink>);

impl ByteSink for SharedVecSink {
    fn write_bytes(&self, data: &[u8]) -> std::io::Result<()> {
        self.0 .0.lock().unwrap().extend_from_slice(data);
        Ok(())
    }
}

/// Write a mono 16-bit FLAC fixture with a correct STREAMINFO frame count.
fn write_flac(path: &Path, frames: usize) {
    let sink = Arc::new(VecSink(Mutex::new(Vec::new())));
    let mut writer = FlacStreamWriter::new(
        Box::new(SharedVecSink(sink.clone())),
        FlacSpec::new(44100, 1, 16),
    )
    .unwrap();
    let samples: Vec<f32> = (0..frames).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
    writer.write_frames(&samples).unwrap();
    writer.finalize().unwrap();

    let mut bytes = sink.0.lock().unwrap().clone();
    // Patch the total-sample count the streaming encoder left at zero.
    let count = frames as u32;
    bytes[22..26].copy_from_slice(&count.to_be_bytes());
    std::fs::write(path, bytes).unwrap();
}

/// Write a mono 16-bit WAV fixture.
fn write_wav(path: &Path, frames: usize) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 44100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..frames {
        let v = ((i as f32 * 0.01).sin() * 0.5 * 32767.0) as i16;
        writer.write_sample(v).unwrap();
    }
    writer.finalize().unwrap();
}

const DIRAC_CONF: &str = "/convolver/new 1 1 64 128\n/impulse/dirac 1 1 1.0 0\n";

struct Fixture {
    _root: tempfile::TempDir,
    music: PathBuf,
}

fn setup(gapless: bool) -> (Fixture, Arc<FolveFilesystem>) {
    let root = tempfile::tempdir().unwrap();
    let music = root.path().join("music");
    std::fs::create_dir(&music).unwrap();
    let base = root.path().join("filters");
    for sub in ["lowpass", "highpass"] {
        let dir = base.join(sub);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("filter-44100.conf"), DIRAC_CONF).unwrap();
    }
    let fs = FolveFilesystem::new(FolveOptions {
        underlying_dir: music.clone(),
        config_dirs: vec![base.join("lowpass"), base.join("highpass")],
        gapless_processing: gapless,
        ..FolveOptions::default()
    })
    .unwrap();
    fs.setup_initial_config();
    (
        Fixture {
            _root: root,
            music,
        },
        fs,
    )
}

/// Read the handler's stream sequentially until end of data.
fn stream_fully(handler: &dyn folve_engine::FileHandler) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 << 10];
    loop {
        let n = handler.read(&mut buf, out.len() as u64).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[test]
fn header_only_access_does_not_convolve() {
    let (fx, fs) = setup(false);
    write_flac(&fx.music.join("long.flac"), 20000);

    let handler = fs.get_or_create_handler("/long.flac").unwrap();
    let mut buf = vec![0u8; 4096];
    let n = handler.read(&mut buf, 0).unwrap();
    // fLaC marker plus the 38-byte STREAMINFO block; a short read, since
    // probing metadata must not start the convolver.
    assert_eq!(n, 42);
    assert_eq!(&buf[..4], b"fLaC");

    let stats = handler.handler_stats();
    assert_eq!(stats.buffer_progress, 0.0);
    assert_eq!(stats.filter_dir, "lowpass");
    assert_eq!(stats.format, "44.1kHz, 16 Bit");

    fs.close("/long.flac", &*handler);
    fs.shutdown();
}

#[test]
fn linear_streaming_produces_decodable_flac() {
    let (fx, fs) = setup(false);
    write_wav(&fx.music.join("tone.wav"), 44100);

    let handler = fs.get_or_create_handler("/tone.wav").unwrap();
    let stats = handler.handler_stats();
    assert_eq!(stats.duration_seconds, 1);

    let encoded = stream_fully(&*handler);
    assert!(encoded.len() > 42, "some audio must have been produced");

    let stats = handler.handler_stats();
    assert!((stats.buffer_progress - 1.0).abs() < 1e-6);
    assert!(stats.max_output_value > 0.0);
    assert!(stats.message.is_empty(), "unexpected: {}", stats.message);

    // The produced stream is a valid FLAC file holding the (dirac-
    // convolved, i.e. nearly untouched) input.
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&encoded).unwrap();
    tmp.flush().unwrap();
    let mut reader = AudioFileReader::open(tmp.reopen().unwrap()).unwrap();
    assert_eq!(reader.info().frames, Some(44100));
    assert_eq!(reader.info().channels, 1);

    use folve_dsp::FrameReader;
    let mut decoded = Vec::new();
    let mut frames = vec![0.0f32; 1024];
    loop {
        let n = reader.read_frames(&mut frames, 1024).unwrap();
        if n == 0 {
            break;
        }
        decoded.extend_from_slice(&frames[..n]);
    }
    assert_eq!(decoded.len(), 44100);
    for (i, d) in decoded.iter().enumerate().step_by(1000) {
        let expected = (i as f32 * 0.01).sin() * 0.5;
        assert!((d - expected).abs() < 1e-2, "frame {i}: {d} vs {expected}");
    }

    fs.close("/tone.wav", &*handler);
    fs.shutdown();
}

#[test]
fn near_eof_seek_returns_zeros_without_convolving() {
    let (fx, fs) = setup(false);
    let path = fx.music.join("skip.flac");
    write_flac(&path, 30000);
    let original_size = std::fs::metadata(&path).unwrap().len();

    let handler = fs.get_or_create_handler("/skip.flac").unwrap();
    let reported = handler.stat().unwrap().size;
    assert_eq!(reported, (original_size as f64 * 1.25) as u64);

    let mut buf = vec![0u8; 512];
    let n = handler.read(&mut buf, reported - 100).unwrap();
    assert_eq!(n, 100);
    assert!(buf[..n].iter().all(|&b| b == 0));

    // No convolution happened for the fake read.
    assert_eq!(handler.handler_stats().buffer_progress, 0.0);

    fs.close("/skip.flac", &*handler);
    fs.shutdown();
}

#[test]
fn gapless_handoff_to_alphabetic_successor() {
    let (fx, fs) = setup(true);
    // 300 frames = 2 full fragments of 128 plus a 44-frame tail, so the
    // final fragment is incomplete and hand-off triggers.
    for name in ["a.wav", "b.wav", "c.wav"] {
        write_wav(&fx.music.join(name), 300);
    }

    let handler_a = fs.get_or_create_handler("/a.wav").unwrap();
    let encoded = stream_fully(&*handler_a);
    assert!(encoded.len() > 42);

    let stats_a = handler_a.handler_stats();
    assert!(stats_a.out_gapless, "donor must report the hand-off");
    assert!(!stats_a.in_gapless);

    // The successor was opened through the cache by the hand-off path, so
    // our open is a cache hit.
    let reopens_before = fs.total_file_reopen();
    let handler_b = fs.get_or_create_handler("/b.wav").unwrap();
    assert_eq!(fs.total_file_reopen(), reopens_before + 1);
    assert!(handler_b.handler_stats().in_gapless);

    fs.close("/b.wav", &*handler_b);
    fs.close("/a.wav", &*handler_a);
    fs.shutdown();
}

#[test]
fn filter_switch_affects_only_new_opens() {
    let (fx, fs) = setup(false);
    write_wav(&fx.music.join("x.wav"), 500);

    let handler_lo = fs.get_or_create_handler("/x.wav").unwrap();
    assert_eq!(handler_lo.filter_dir(), "lowpass");

    assert!(fs.switch_current_config_dir("highpass"));

    // The pinned handler keeps its filter; a fresh open uses the new one.
    let handler_hi = fs.get_or_create_handler("/x.wav").unwrap();
    assert_eq!(handler_lo.filter_dir(), "lowpass");
    assert_eq!(handler_hi.filter_dir(), "highpass");
    assert_eq!(fs.total_file_openings(), 2, "different cache keys");

    fs.close("/x.wav", &*handler_lo);
    fs.close("/x.wav", &*handler_hi);
    fs.shutdown();
}

#[test]
fn non_audio_files_pass_through() {
    let (fx, fs) = setup(false);
    let content = b"liner notes: recorded in a barn";
    std::fs::write(fx.music.join("notes.txt"), content).unwrap();

    let handler = fs.get_or_create_handler("/notes.txt").unwrap();
    let mut buf = vec![0u8; 256];
    let n = handler.read(&mut buf, 0).unwrap();
    assert_eq!(&buf[..n], content);
    assert_eq!(handler.filter_dir(), "");
    assert_eq!(handler.stat().unwrap().size, content.len() as u64);

    fs.close("/notes.txt", &*handler);
    fs.shutdown();
}

#[test]
fn truncated_input_reports_premature_eof() {
    let (fx, fs) = setup(false);
    let path = fx.music.join("cut.wav");
    write_wav(&path, 2000);
    // Chop off the second half of the sample data; the header still
    // promises 2000 frames.
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 2000).unwrap();

    let handler = fs.get_or_create_handler("/cut.wav").unwrap();
    let encoded = stream_fully(&*handler);
    assert!(encoded.len() > 42, "the decodable part is still served");

    let stats = handler.handler_stats();
    assert!(
        stats.message.contains("Premature EOF"),
        "message: {}",
        stats.message
    );

    fs.close("/cut.wav", &*handler);
    fs.shutdown();
}

#[test]
fn handlers_survive_close_reopen_cycles() {
    let (fx, fs) = setup(false);
    write_wav(&fx.music.join("keep.wav"), 1000);

    let first = fs.get_or_create_handler("/keep.wav").unwrap();
    let mut buf = vec![0u8; 8 << 10];
    first.read(&mut buf, 0).unwrap();
    fs.close("/keep.wav", &*first);
    drop(first);

    // Within cache capacity the handler is kept as idle and re-pinned.
    let stats = fs.handler_cache().get_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].status, HandlerStatus::Idle);

    let second = fs.get_or_create_handler("/keep.wav").unwrap();
    assert_eq!(fs.total_file_reopen(), 1);
    fs.close("/keep.wav", &*second);
    fs.shutdown();
}
