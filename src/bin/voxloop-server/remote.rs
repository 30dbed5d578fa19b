//! HTTP-backed recognition, synthesis and language-model collaborators.
//!
//! Wire contracts:
//! - STT: `POST <stt-url>` with a 16 kHz mono WAV body, answers `{"text": "..."}`.
//! - TTS: `POST <tts-url>` with `{"text", "voice"}`, answers a 16-bit WAV body.
//! - LLM: `POST <llm-url>` with the chat request as JSON, answers newline-delimited JSON
//!   (`{"text": "..."}` or `{"rollback": true}`). SSE-style `data:` prefixes are accepted.

use std::io::Cursor;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};

use voxloop::collaborators::{
    AudioSource, ChatRequest, LlmChunk, LlmService, LlmStream, SpeechClip, SttService, TtsRequest,
    TtsService,
};
use voxloop::conversation::ChatMessage;
use voxloop::store::device_wav_spec;
use voxloop::{Result, TtsError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("failed to build HTTP client")
}

pub struct HttpStt {
    client: reqwest::Client,
    url: String,
}

impl HttpStt {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[derive(Deserialize)]
struct SttResponse {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl SttService for HttpStt {
    async fn recognize(&self, audio: AudioSource) -> Result<String> {
        let pcm = audio.collect().await;
        if pcm.is_empty() {
            return Ok(String::new());
        }

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "audio/wav")
            .body(encode_wav(&pcm)?)
            .send()
            .await
            .context("stt request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("stt provider error {status}: {body}").into());
        }

        let body: SttResponse = response.json().await.context("invalid stt response")?;
        Ok(body.text)
    }
}

pub struct HttpTts {
    client: reqwest::Client,
    url: String,
}

impl HttpTts {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[derive(Serialize)]
struct TtsBody<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
}

#[async_trait]
impl TtsService for HttpTts {
    async fn synthesize(&self, request: TtsRequest) -> std::result::Result<SpeechClip, TtsError> {
        let body = TtsBody {
            text: &request.text,
            voice: request.voice.as_deref(),
        };
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| TtsError::Provider(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TtsError::Provider(format!("status {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| TtsError::Provider(err.to_string()))?;
        clip_from_wav(&bytes)
    }
}

pub struct HttpLlm {
    client: reqwest::Client,
    url: String,
}

impl HttpLlm {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    session_id: &'a str,
    device_id: &'a str,
    role_id: &'a str,
    messages: &'a [ChatMessage],
    use_tools: bool,
}

#[derive(Deserialize)]
struct ChatLine {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    rollback: bool,
}

#[async_trait]
impl LlmService for HttpLlm {
    async fn chat_stream(&self, request: ChatRequest) -> Result<LlmStream> {
        let body = ChatBody {
            session_id: &request.session_id,
            device_id: &request.device_id,
            role_id: &request.role_id,
            messages: &request.messages,
            use_tools: request.use_tools,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("llm request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("llm provider error {status}: {body}").into());
        }

        let chunks = split_lines(response.bytes_stream()).filter_map(|line| async move {
            match line {
                Ok(line) => parse_chat_line(&line).transpose(),
                Err(err) => Some(Err(anyhow!("llm stream interrupted: {err}").into())),
            }
        });
        Ok(chunks.boxed())
    }
}

fn encode_wav(pcm: &[i16]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, device_wav_spec())?;
        for &sample in pcm {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

fn clip_from_wav(bytes: &[u8]) -> std::result::Result<SpeechClip, TtsError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|err| TtsError::Provider(format!("invalid wav: {err}")))?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(TtsError::Provider(format!(
            "expected 16-bit PCM, got {} bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }

    let pcm = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| TtsError::Provider(format!("invalid wav: {err}")))?;
    if pcm.is_empty() {
        return Err(TtsError::EmptyClip);
    }

    Ok(SpeechClip {
        pcm,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Re-chunk a byte stream into lines (without the trailing newline). A final unterminated
/// line is still yielded; a transport error ends the stream after being reported.
fn split_lines<S, B, E>(body: S) -> impl Stream<Item = std::result::Result<Vec<u8>, E>>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
{
    futures_util::stream::unfold(
        (Box::pin(body), Vec::<u8>::new(), false),
        |(mut body, mut buf, mut done)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let mut line: Vec<u8> = buf.drain(..=pos).collect();
                    line.pop();
                    return Some((Ok(line), (body, buf, done)));
                }
                if done {
                    if buf.is_empty() {
                        return None;
                    }
                    let line = std::mem::take(&mut buf);
                    return Some((Ok(line), (body, buf, done)));
                }
                match body.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                    Some(Err(err)) => {
                        buf.clear();
                        return Some((Err(err), (body, buf, true)));
                    }
                    None => done = true,
                }
            }
        },
    )
}

fn parse_chat_line(line: &[u8]) -> Result<Option<LlmChunk>> {
    let line = std::str::from_utf8(line).context("llm stream is not utf-8")?;
    let line = line.trim();
    let line = line.strip_prefix("data:").map_or(line, str::trim);
    if line.is_empty() || line == "[DONE]" {
        return Ok(None);
    }

    let parsed: ChatLine = serde_json::from_str(line)?;
    if parsed.rollback {
        return Ok(Some(LlmChunk::Rollback));
    }
    Ok(parsed
        .text
        .filter(|text| !text.is_empty())
        .map(LlmChunk::Text))
}
