use std::path::Path;

use anyhow::{Context, anyhow, ensure};
use ort::session::{Session, SessionInputValue};
use ort::value::Tensor;

use super::classifier::{SpeechClassifier, WINDOW_SAMPLES};
use crate::Result;
use crate::codec::SAMPLE_RATE;

/// Samples of the previous window prepended to each inference call (Silero v5 at 16 kHz).
const CONTEXT_SAMPLES: usize = 64;

/// Recurrent state layout: `[2, batch=1, 128]`.
const STATE_DIMS: [usize; 3] = [2, 1, 128];
const STATE_LEN: usize = 2 * 128;

/// Silero VAD (ONNX) speech classifier.
///
/// Expects the v5 export: inputs `input`, `state`, `sr`; outputs `output` (`[1, 1]`) and
/// `stateN`. The recurrent state and rolling context survive across windows until
/// [`SpeechClassifier::reset`].
pub struct SileroClassifier {
    session: Session,
    state: Vec<f32>,
    context: Vec<f32>,
}

impl SileroClassifier {
    pub fn new(model_path: impl AsRef<Path>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let session = Session::builder()
            .context("failed to create ONNX Runtime session builder")?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load Silero VAD model from '{}'", model_path.display()))?;

        for required in ["input", "state", "sr"] {
            ensure!(
                session.inputs.iter().any(|i| i.name == required),
                "'{}' does not look like Silero VAD: missing input '{required}'",
                model_path.display()
            );
        }

        Ok(Self {
            session,
            state: vec![0.0; STATE_LEN],
            context: vec![0.0; CONTEXT_SAMPLES],
        })
    }

    fn infer(&mut self, window: &[f32]) -> anyhow::Result<f32> {
        ensure!(
            window.len() == WINDOW_SAMPLES,
            "silero expects {WINDOW_SAMPLES}-sample windows, got {}",
            window.len()
        );

        let mut audio = Vec::with_capacity(CONTEXT_SAMPLES + WINDOW_SAMPLES);
        audio.extend_from_slice(&self.context);
        audio.extend_from_slice(window);

        let input = Tensor::from_array(([1usize, audio.len()], audio.into_boxed_slice()))
            .context("failed to build 'input' tensor")?;
        let state = Tensor::from_array((STATE_DIMS, self.state.clone().into_boxed_slice()))
            .context("failed to build 'state' tensor")?;
        let sr = Tensor::from_array(((), vec![SAMPLE_RATE as i64].into_boxed_slice()))
            .context("failed to build 'sr' tensor")?;

        let inputs: Vec<(String, SessionInputValue<'static>)> = vec![
            ("input".to_owned(), SessionInputValue::Owned(input.into_dyn())),
            ("state".to_owned(), SessionInputValue::Owned(state.into_dyn())),
            ("sr".to_owned(), SessionInputValue::Owned(sr.into_dyn())),
        ];

        let (probability, next_state) = {
            let outputs = self
                .session
                .run(inputs)
                .context("failed to run Silero VAD model")?;
            ensure!(outputs.len() >= 2, "silero returned {} outputs, expected 2", outputs.len());

            let (_, prob) = outputs[0]
                .try_extract_tensor::<f32>()
                .context("silero 'output' is not an f32 tensor")?;
            let (_, state) = outputs[1]
                .try_extract_tensor::<f32>()
                .context("silero 'stateN' is not an f32 tensor")?;

            let probability = *prob.first().ok_or_else(|| anyhow!("silero 'output' is empty"))?;
            (probability, state.to_vec())
        };

        ensure!(
            next_state.len() == STATE_LEN,
            "silero state has {} values, expected {STATE_LEN}",
            next_state.len()
        );
        self.state = next_state;
        self.context
            .copy_from_slice(&window[WINDOW_SAMPLES - CONTEXT_SAMPLES..]);

        Ok(probability)
    }
}

impl SpeechClassifier for SileroClassifier {
    fn predict(&mut self, window: &[f32]) -> Result<f32> {
        Ok(self.infer(window)?)
    }

    fn reset(&mut self) {
        self.state.fill(0.0);
        self.context.fill(0.0);
    }
}
