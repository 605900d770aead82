//! Parser for the filter configuration format.
//!
//! The format is line-oriented: blank lines and `#` comments are skipped,
//! commands start with `/`. A configuration first declares the convolver
//! dimensions with `/convolver/new` and then loads impulse data into the
//! routing matrix with the `/impulse/...` commands. File name arguments may
//! be quoted with `"..."` or `'...'` and support backslash escapes.

use crate::convolver::{fragment_for_impulse_len, Convolver, MAX_CHANNELS, MAX_IMPULSE_LEN};
use crate::error::DspError;
use std::f32::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Scan one token from `src`, honouring the quoting rules: tabs count as
/// spaces, a leading `"` or `'` quotes the token, backslash escapes the next
/// character (except inside single quotes), an unquoted space or the end of
/// input terminates the token. Returns the token and the number of bytes
/// consumed, or `None` on malformed input (unterminated quote, quote in the
/// middle of a token, or nothing but whitespace).
pub(crate) fn scan_string(src: &str) -> Option<(String, usize)> {
    let bytes = src.as_bytes();
    let mut token = String::new();
    let mut quote: Option<u8> = None;
    let mut escaped = false;
    let mut i = 0;

    loop {
        let c = if i < bytes.len() { bytes[i] } else { 0 };
        i += 1;
        let c = if c == b'\t' { b' ' } else { c };

        if c < b' ' {
            // Control character or end of input: an error inside quotes or
            // a pending escape, otherwise it terminates the scan.
            if quote.is_some() || escaped {
                return None;
            }
            i -= 1;
            return if token.is_empty() { None } else { Some((token, i)) };
        }
        if escaped {
            token.push(c as char);
            escaped = false;
            continue;
        }
        if c == b'\\' {
            if quote == Some(b'\'') {
                token.push('\\');
            } else {
                escaped = true;
            }
            continue;
        }
        if c == b'\'' || c == b'"' {
            if quote == Some(c) {
                return Some((token, i));
            }
            if quote.is_some() || !token.is_empty() {
                return None;
            }
            quote = Some(c);
            continue;
        }
        if c == b' ' {
            if quote.is_some() {
                token.push(' ');
                continue;
            }
            if !token.is_empty() {
                return Some((token, i));
            }
            continue; // leading space
        }
        token.push(c as char);
    }
}

/// Cursor over the argument part of a command line.
struct Args<'a> {
    rest: &'a str,
}

impl<'a> Args<'a> {
    fn new(rest: &'a str) -> Self {
        Self { rest }
    }

    /// Parse the next whitespace-separated numeric field.
    fn num<T: FromStr>(&mut self) -> Option<T> {
        let trimmed = self.rest.trim_start();
        let end = trimmed
            .find(char::is_whitespace)
            .unwrap_or(trimmed.len());
        if end == 0 {
            return None;
        }
        let (tok, rest) = trimmed.split_at(end);
        self.rest = rest;
        tok.parse().ok()
    }

    /// Parse the next (possibly quoted) string token.
    fn string(&mut self) -> Option<String> {
        let (tok, used) = scan_string(self.rest)?;
        self.rest = &self.rest[used..];
        Some(tok)
    }
}

/// Parse state while walking a configuration file.
struct Parser<'a> {
    config_path: &'a Path,
    sample_rate: u32,
    cdir: PathBuf,
    convolver: Option<Convolver>,
    impulse_len: usize,
}

/// Parse the filter configuration at `path` and build the convolver it
/// describes. `sample_rate` is the rate of the audio the filter will run
/// against; impulse files with a different rate are only warned about.
pub fn parse_config(path: &Path, sample_rate: u32) -> Result<Convolver, DspError> {
    let text = fs::read_to_string(path).map_err(|source| DspError::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;

    let mut parser = Parser {
        config_path: path,
        sample_rate,
        cdir: path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf(),
        convolver: None,
        impulse_len: 0,
    };

    for (idx, raw_line) in text.lines().enumerate() {
        parser.line(idx + 1, raw_line)?;
    }

    parser.convolver.ok_or_else(|| DspError::NoConvolver {
        path: path.to_path_buf(),
        line: text.lines().count(),
    })
}

impl Parser<'_> {
    fn err_params(&self, line: usize) -> DspError {
        DspError::Parameters {
            path: self.config_path.to_path_buf(),
            line,
        }
    }

    fn line(&mut self, lnum: usize, raw: &str) -> Result<(), DspError> {
        if !raw.starts_with('/') {
            let trimmed = raw.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return Ok(());
            }
            return Err(DspError::Syntax {
                path: self.config_path.to_path_buf(),
                line: lnum,
            });
        }
        let (command, rest) = raw
            .split_once(char::is_whitespace)
            .unwrap_or((raw, ""));
        let mut args = Args::new(rest);

        match command {
            "/cd" => {
                let dir = args.string().ok_or_else(|| self.err_params(lnum))?;
                let dir = PathBuf::from(dir);
                self.cdir = if dir.is_absolute() {
                    dir
                } else {
                    self.cdir.join(dir)
                };
                Ok(())
            }
            "/convolver/new" => self.convolver_new(lnum, &mut args),
            "/impulse/read" => self.impulse_read(lnum, &mut args),
            "/impulse/dirac" => self.impulse_dirac(lnum, &mut args),
            "/impulse/hilbert" => self.impulse_hilbert(lnum, &mut args),
            "/impulse/copy" => self.impulse_copy(lnum, &mut args),
            // Port naming is accepted for compatibility and ignored.
            "/input/name" | "/output/name" => Ok(()),
            other => Err(DspError::UnknownCommand {
                path: self.config_path.to_path_buf(),
                line: lnum,
                command: other.to_string(),
            }),
        }
    }

    fn convolver_new(&mut self, lnum: usize, args: &mut Args) -> Result<(), DspError> {
        let ninp: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let nout: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let _partition: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let size: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let density: f32 = args.num().unwrap_or(0.0);

        let params_err = |reason: String| DspError::ConvolverParams {
            path: self.config_path.to_path_buf(),
            line: lnum,
            reason,
        };
        if ninp == 0 || ninp > MAX_CHANNELS {
            return Err(params_err(format!("number of inputs ({ninp})")));
        }
        if nout == 0 || nout > MAX_CHANNELS {
            return Err(params_err(format!("number of outputs ({nout})")));
        }
        if size == 0 || size > MAX_IMPULSE_LEN {
            return Err(params_err(format!("convolver size ({size})")));
        }
        if !(0.0..=1.0).contains(&density) {
            return Err(params_err(format!("density ({density})")));
        }

        let fragment = fragment_for_impulse_len(size);
        tracing::debug!(ninp, nout, size, fragment, "configuring convolver");
        self.convolver = Some(Convolver::new(ninp, nout, size, fragment));
        self.impulse_len = size;
        Ok(())
    }

    /// Validate 1-based channel numbers against the convolver dimensions.
    fn check_inout(&self, lnum: usize, inp: usize, out: usize) -> Result<(), DspError> {
        let Some(conv) = &self.convolver else {
            return Err(DspError::NoConvolver {
                path: self.config_path.to_path_buf(),
                line: lnum,
            });
        };
        if inp < 1 || inp > conv.num_inputs() || out < 1 || out > conv.num_outputs() {
            return Err(DspError::ChannelRange {
                path: self.config_path.to_path_buf(),
                line: lnum,
            });
        }
        Ok(())
    }

    fn impulse_read(&mut self, lnum: usize, args: &mut Args) -> Result<(), DspError> {
        let inp: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let out: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let gain: f32 = args.num().ok_or_else(|| self.err_params(lnum))?;
        let delay: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let offset: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let length: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let ichan: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let file = args.string().ok_or_else(|| self.err_params(lnum))?;
        self.check_inout(lnum, inp, out)?;

        let file = PathBuf::from(file);
        let path = if file.is_absolute() {
            file
        } else {
            self.cdir.join(file)
        };

        let impulse_err = |reason: String| DspError::ImpulseFile {
            path: self.config_path.to_path_buf(),
            line: lnum,
            file: path.clone(),
            reason,
        };

        let mut reader =
            hound::WavReader::open(&path).map_err(|e| impulse_err(e.to_string()))?;
        let spec = reader.spec();
        if spec.sample_rate != self.sample_rate {
            tracing::warn!(
                file = %path.display(),
                impulse_rate = spec.sample_rate,
                audio_rate = self.sample_rate,
                "impulse sample rate does not match"
            );
        }
        let nchan = spec.channels as usize;
        if ichan < 1 || ichan > nchan {
            return Err(impulse_err(format!(
                "channel {ichan} not available ({nchan} channels)"
            )));
        }
        let total_frames = reader.len() as usize / nchan;
        if offset > total_frames {
            return Err(impulse_err(format!("cannot seek to offset {offset}")));
        }
        reader
            .seek(offset as u32)
            .map_err(|e| impulse_err(e.to_string()))?;

        let mut length = if length == 0 { total_frames - offset } else { length };
        if delay >= self.impulse_len {
            tracing::warn!(line = lnum, "impulse data entirely past filter length");
            return Ok(());
        }
        if length > self.impulse_len - delay {
            length = self.impulse_len - delay;
            tracing::warn!(line = lnum, "impulse data truncated to filter length");
        }

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .take(length * nchan)
                .collect::<Result<_, _>>()
                .map_err(|e| impulse_err(e.to_string()))?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .take(length * nchan)
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| impulse_err(e.to_string()))?
            }
        };

        let data: Vec<f32> = samples
            .chunks(nchan)
            .filter_map(|frame| frame.get(ichan - 1))
            .map(|&v| v * gain)
            .collect();
        let conv = self.convolver.as_mut().unwrap_or_else(|| unreachable!());
        conv.add_impulse(inp - 1, out - 1, &data, delay);
        Ok(())
    }

    fn impulse_dirac(&mut self, lnum: usize, args: &mut Args) -> Result<(), DspError> {
        let inp: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let out: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let gain: f32 = args.num().ok_or_else(|| self.err_params(lnum))?;
        let delay: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        self.check_inout(lnum, inp, out)?;

        if delay < self.impulse_len {
            let conv = self.convolver.as_mut().unwrap_or_else(|| unreachable!());
            conv.add_impulse(inp - 1, out - 1, &[gain], delay);
        }
        Ok(())
    }

    fn impulse_hilbert(&mut self, lnum: usize, args: &mut Args) -> Result<(), DspError> {
        let inp: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let out: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let gain: f32 = args.num().ok_or_else(|| self.err_params(lnum))?;
        let delay: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let length: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        self.check_inout(lnum, inp, out)?;

        if !(64..=65536).contains(&length) {
            return Err(self.err_params(lnum));
        }
        if delay < length / 2 {
            tracing::warn!(line = lnum, "hilbert impulse removed: delay < length/2");
            return Ok(());
        }
        let delay = delay - length / 2;

        // Windowed Hilbert transformer: antisymmetric around the centre tap.
        let gain = gain * 2.0 / PI;
        let h = length / 2;
        let mut hdata = vec![0.0f32; length];
        let mut i = 1;
        while i < h {
            let mut v = gain / i as f32;
            let w = 0.43 + 0.57 * (i as f32 * PI / h as f32).cos();
            v *= w;
            hdata[h + i] = -v;
            hdata[h - i] = v;
            i += 2;
        }

        let conv = self.convolver.as_mut().unwrap_or_else(|| unreachable!());
        conv.add_impulse(inp - 1, out - 1, &hdata, delay);
        Ok(())
    }

    fn impulse_copy(&mut self, lnum: usize, args: &mut Args) -> Result<(), DspError> {
        let in1: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let out1: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let in2: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        let out2: usize = args.num().ok_or_else(|| self.err_params(lnum))?;
        self.check_inout(lnum, in1, out1)?;
        self.check_inout(lnum, in2, out2)?;
        if in1 == in2 && out1 == out2 {
            return Err(self.err_params(lnum));
        }

        let conv = self.convolver.as_mut().unwrap_or_else(|| unreachable!());
        conv.copy_impulse(in2 - 1, out2 - 1, in1 - 1, out1 - 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn scan_plain_token() {
        let (tok, used) = scan_string("hello world").unwrap();
        assert_eq!(tok, "hello");
        assert_eq!(used, 6);
    }

    #[test]
    fn scan_skips_leading_space() {
        let (tok, _) = scan_string("   token").unwrap();
        assert_eq!(tok, "token");
    }

    #[test]
    fn scan_double_quoted_with_space() {
        let (tok, used) = scan_string("\"a file.wav\" rest").unwrap();
        assert_eq!(tok, "a file.wav");
        assert_eq!(used, 12);
    }

    #[test]
    fn scan_single_quotes_keep_backslash() {
        let (tok, _) = scan_string("'a\\b'").unwrap();
        assert_eq!(tok, "a\\b");
    }

    #[test]
    fn scan_escape_outside_single_quotes() {
        let (tok, _) = scan_string("a\\ b").unwrap();
        assert_eq!(tok, "a b");
    }

    #[test]
    fn scan_rejects_unterminated_quote() {
        assert!(scan_string("\"oops").is_none());
    }

    #[test]
    fn scan_rejects_mid_token_quote() {
        assert!(scan_string("ab\"cd\"").is_none());
    }

    #[test]
    fn scan_rejects_empty() {
        assert!(scan_string("").is_none());
        assert!(scan_string("   ").is_none());
    }

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".conf").tempfile().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parse_dirac_config() {
        let f = write_config(
            "# simple pass-through filter\n\
             /convolver/new 2 2 256 1024\n\
             /impulse/dirac 1 1 1.0 0\n\
             /impulse/dirac 2 2 1.0 0\n",
        );
        let conv = parse_config(f.path(), 44100).unwrap();
        assert_eq!(conv.num_inputs(), 2);
        assert_eq!(conv.num_outputs(), 2);
        assert!(conv.has_impulse_data());
        assert_eq!(conv.fragment(), 1024);
    }

    #[test]
    fn parse_rejects_impulse_before_convolver() {
        let f = write_config("/impulse/dirac 1 1 1.0 0\n");
        assert!(matches!(
            parse_config(f.path(), 44100),
            Err(DspError::NoConvolver { .. })
        ));
    }

    #[test]
    fn parse_rejects_channel_out_of_range() {
        let f = write_config("/convolver/new 1 1 256 1024\n/impulse/dirac 2 1 1.0 0\n");
        assert!(matches!(
            parse_config(f.path(), 44100),
            Err(DspError::ChannelRange { .. })
        ));
    }

    #[test]
    fn parse_rejects_stray_text() {
        let f = write_config("/convolver/new 1 1 256 1024\nnot a command\n");
        assert!(matches!(
            parse_config(f.path(), 44100),
            Err(DspError::Syntax { .. })
        ));
    }

    #[test]
    fn parse_rejects_unknown_command() {
        let f = write_config("/convolver/frobnicate 1 2\n");
        assert!(matches!(
            parse_config(f.path(), 44100),
            Err(DspError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn parse_hilbert_config() {
        let f = write_config(
            "/convolver/new 1 1 256 2048\n/impulse/hilbert 1 1 1.0 512 1024\n",
        );
        let conv = parse_config(f.path(), 48000).unwrap();
        assert!(conv.has_impulse_data());
    }

    #[test]
    fn parse_copy_duplicates_routing() {
        let f = write_config(
            "/convolver/new 2 2 256 1024\n\
             /impulse/dirac 1 1 0.5 0\n\
             /impulse/copy 2 2 1 1\n",
        );
        let mut conv = parse_config(f.path(), 44100).unwrap();
        conv.input_mut(0).fill(1.0);
        conv.input_mut(1).fill(1.0);
        conv.process();
        // Both diagonal routings carry the same 0.5 dirac.
        assert!((conv.output(0)[100] - 0.5).abs() < 1e-3);
        assert!((conv.output(1)[100] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn impulse_read_from_wav() {
        let dir = tempfile::tempdir().unwrap();
        let wav_path = dir.path().join("impulse.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&wav_path, spec).unwrap();
        writer.write_sample(i16::MAX).unwrap();
        for _ in 0..63 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let conf_path = dir.path().join("filter-44100.conf");
        fs::write(
            &conf_path,
            "/convolver/new 1 1 64 1024\n/impulse/read 1 1 1.0 0 0 0 1 impulse.wav\n",
        )
        .unwrap();

        let mut conv = parse_config(&conf_path, 44100).unwrap();
        // Near-unit dirac from the WAV: output tracks input.
        conv.input_mut(0).fill(0.25);
        conv.process();
        assert!((conv.output(0)[50] - 0.25).abs() < 1e-2);
    }
}
