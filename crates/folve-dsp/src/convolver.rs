//! Uniformly partitioned frequency-domain FIR convolution.
//!
//! The engine processes audio in fixed-size fragments. Impulse responses are
//! split into fragment-sized partitions whose spectra are applied against a
//! frequency-domain delay line of recent input blocks (overlap-save), so the
//! per-fragment cost stays bounded no matter how long the filter is.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::collections::VecDeque;
use std::sync::Arc;

/// Maximum number of input or output channels per convolver.
pub const MAX_CHANNELS: usize = 64;
/// Maximum impulse response length in samples.
pub const MAX_IMPULSE_LEN: usize = 0x0010_0000;
/// Largest fragment the engine will pick.
const MAX_FRAGMENT: usize = 16384;
/// Smallest fragment the engine will pick.
const MIN_FRAGMENT: usize = 64;

/// Pick the fragment size for a given impulse length: start large and halve
/// while the fragment still covers the impulse at least twice over.
pub fn fragment_for_impulse_len(impulse_len: usize) -> usize {
    let mut fragment = MAX_FRAGMENT;
    while fragment > MIN_FRAGMENT && fragment >= 2 * impulse_len {
        fragment /= 2;
    }
    fragment
}

/// A multi-channel partitioned FIR convolver with fixed fragment size.
///
/// Usage per fragment: fill every input staging buffer via [`input_mut`],
/// call [`process`], then read the results from [`output`].
///
/// [`input_mut`]: Convolver::input_mut
/// [`process`]: Convolver::process
/// [`output`]: Convolver::output
pub struct Convolver {
    num_inputs: usize,
    num_outputs: usize,
    impulse_len: usize,
    fragment: usize,
    fft_len: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    /// Time-domain impulse per (input, output) routing; `None` = no routing.
    impulses: Vec<Vec<Option<Vec<f32>>>>,
    /// Per-partition spectra, rebuilt lazily after impulse edits.
    spectra: Vec<Vec<Option<Vec<Vec<Complex<f32>>>>>>,
    prepared: bool,
    num_partitions: usize,
    /// Per input: spectra of recent input blocks, newest first.
    history: Vec<VecDeque<Vec<Complex<f32>>>>,
    /// Per input: previous fragment for the overlap-save input block.
    prev_input: Vec<Vec<f32>>,
    inputs: Vec<Vec<f32>>,
    outputs: Vec<Vec<f32>>,
}

impl Convolver {
    /// Create a convolver for the given routing matrix dimensions.
    ///
    /// `impulse_len` is the maximum filter length in samples; `fragment` the
    /// fixed block size (usually from [`fragment_for_impulse_len`]).
    pub fn new(
        num_inputs: usize,
        num_outputs: usize,
        impulse_len: usize,
        fragment: usize,
    ) -> Self {
        let fft_len = 2 * fragment;
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_len);
        let ifft = planner.plan_fft_inverse(fft_len);
        let num_partitions = impulse_len.div_ceil(fragment).max(1);

        Self {
            num_inputs,
            num_outputs,
            impulse_len,
            fragment,
            fft_len,
            fft,
            ifft,
            impulses: vec![vec![None; num_outputs]; num_inputs],
            spectra: vec![vec![None; num_outputs]; num_inputs],
            prepared: false,
            num_partitions,
            history: vec![VecDeque::new(); num_inputs],
            prev_input: vec![vec![0.0; fragment]; num_inputs],
            inputs: vec![vec![0.0; fragment]; num_inputs],
            outputs: vec![vec![0.0; fragment]; num_outputs],
        }
    }

    /// Number of input channels.
    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    /// Number of output channels.
    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    /// Fragment size in samples.
    pub fn fragment(&self) -> usize {
        self.fragment
    }

    /// Accumulate impulse data for the `(input, output)` routing, starting
    /// `delay` samples in. Data past the impulse length is truncated.
    pub fn add_impulse(&mut self, input: usize, output: usize, data: &[f32], delay: usize) {
        let impulse_len = self.impulse_len;
        let impulse = self.impulses[input][output]
            .get_or_insert_with(|| vec![0.0; impulse_len]);
        for (i, &v) in data.iter().enumerate() {
            let pos = delay + i;
            if pos >= impulse_len {
                break;
            }
            impulse[pos] += v;
        }
        self.prepared = false;
    }

    /// Accumulate the impulse of `(from_in, from_out)` into `(to_in, to_out)`.
    pub fn copy_impulse(&mut self, from_in: usize, from_out: usize, to_in: usize, to_out: usize) {
        if let Some(src) = self.impulses[from_in][from_out].clone() {
            self.add_impulse(to_in, to_out, &src, 0);
        }
    }

    /// Whether any routing has impulse data.
    pub fn has_impulse_data(&self) -> bool {
        self.impulses
            .iter()
            .any(|outs| outs.iter().any(Option::is_some))
    }

    /// Input staging buffer for channel `ch` (fragment samples).
    pub fn input_mut(&mut self, ch: usize) -> &mut [f32] {
        &mut self.inputs[ch]
    }

    /// Output buffer for channel `ch`, valid after [`process`](Self::process).
    pub fn output(&self, ch: usize) -> &[f32] {
        &self.outputs[ch]
    }

    fn prepare(&mut self) {
        for inp in 0..self.num_inputs {
            for out in 0..self.num_outputs {
                let Some(impulse) = &self.impulses[inp][out] else {
                    self.spectra[inp][out] = None;
                    continue;
                };
                let mut partitions = Vec::with_capacity(self.num_partitions);
                for p in 0..self.num_partitions {
                    let start = p * self.fragment;
                    let end = (start + self.fragment).min(self.impulse_len);
                    let mut block = vec![Complex::new(0.0, 0.0); self.fft_len];
                    if start < end {
                        for (i, &h) in impulse[start..end].iter().enumerate() {
                            block[i].re = h;
                        }
                    }
                    self.fft.process(&mut block);
                    partitions.push(block);
                }
                self.spectra[inp][out] = Some(partitions);
            }
        }
        self.prepared = true;
    }

    /// Convolve one fragment: consume the input staging buffers, fill the
    /// output buffers with the same number of samples.
    pub fn process(&mut self) {
        if !self.prepared {
            self.prepare();
        }

        // Push the spectrum of [previous, current] input block per channel.
        for ch in 0..self.num_inputs {
            let mut block = vec![Complex::new(0.0, 0.0); self.fft_len];
            for (i, &x) in self.prev_input[ch].iter().enumerate() {
                block[i].re = x;
            }
            for (i, &x) in self.inputs[ch].iter().enumerate() {
                block[self.fragment + i].re = x;
            }
            self.fft.process(&mut block);
            self.history[ch].push_front(block);
            while self.history[ch].len() > self.num_partitions {
                self.history[ch].pop_back();
            }
            self.prev_input[ch].copy_from_slice(&self.inputs[ch]);
        }

        let scale = 1.0 / self.fft_len as f32;
        for out in 0..self.num_outputs {
            let mut acc = vec![Complex::new(0.0, 0.0); self.fft_len];
            for inp in 0..self.num_inputs {
                let Some(partitions) = &self.spectra[inp][out] else {
                    continue;
                };
                for (k, past) in self.history[inp].iter().enumerate() {
                    if k >= partitions.len() {
                        break;
                    }
                    let spectrum = &partitions[k];
                    for (a, (x, h)) in acc.iter_mut().zip(past.iter().zip(spectrum.iter())) {
                        *a += x * h;
                    }
                }
            }
            self.ifft.process(&mut acc);
            // Overlap-save: the second half of the block is valid output.
            for (o, a) in self.outputs[out]
                .iter_mut()
                .zip(acc[self.fragment..].iter())
            {
                *o = a.re * scale;
            }
        }
    }

    /// Clear all signal history; the loaded impulse responses are kept.
    pub fn reset(&mut self) {
        for h in &mut self.history {
            h.clear();
        }
        for p in &mut self.prev_input {
            p.fill(0.0);
        }
        for i in &mut self.inputs {
            i.fill(0.0);
        }
        for o in &mut self.outputs {
            o.fill(0.0);
        }
    }
}
