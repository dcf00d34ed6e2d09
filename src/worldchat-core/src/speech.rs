//! Speech synthesis providers and audio output.
//!
//! The remote provider calls the ElevenLabs text-to-speech API; the local
//! provider runs Kokoro on-device through kokoro-tiny. Both hand encoded
//! clips to an [`AudioSink`].

use async_trait::async_trait;
use kokoro_tiny::TtsEngine;
use std::io::Cursor;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RemoteVoiceConfig;
use crate::error::WorldError;

/// Kokoro output rate.
pub const SAMPLE_RATE: u32 = 24_000;

/// Kokoro has a strict input limit; stay well under it.
const MAX_CHUNK_CHARS: usize = 200;

/// 0.3 seconds between chunks.
const CHUNK_PAUSE_SAMPLES: usize = 7_200;

/// Remote, high-quality synthesis that may fail or run out of quota.
#[async_trait]
pub trait RemoteSynthesizer: Send + Sync {
    /// Encoded audio for `text`.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, WorldError>;
}

/// On-device synthesis, assumed always invocable.
#[async_trait]
pub trait LocalSpeaker: Send + Sync {
    /// Resolve once voices can be enumerated. Must be awaited before `speak`.
    async fn ensure_voices_ready(&self) -> Result<(), WorldError>;

    async fn voices(&self) -> Result<Vec<String>, WorldError>;

    /// Speak `text` to completion, or until `cancel` fires.
    async fn speak(
        &self,
        text: &str,
        locale: &str,
        cancel: &CancellationToken,
    ) -> Result<(), WorldError>;
}

/// The single audio output channel.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play an encoded clip until it ends or `cancel` fires.
    async fn play(&self, audio: Vec<u8>, cancel: &CancellationToken) -> Result<(), WorldError>;
}

/// ElevenLabs text-to-speech client.
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    config: RemoteVoiceConfig,
    api_key: Option<String>,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: RemoteVoiceConfig, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/text-to-speech/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.voice_id
        )
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "text": text,
            "model_id": self.config.model_id,
            "voice_settings": {
                "stability": self.config.stability,
                "similarity_boost": self.config.similarity_boost,
            },
        })
    }
}

#[async_trait]
impl RemoteSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, WorldError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(WorldError::SynthesisUnavailable("no API key configured".to_string()));
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("xi-api-key", api_key)
            .json(&self.request_body(text))
            .send()
            .await
            .map_err(|e| WorldError::SynthesisUnavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorldError::SynthesisUnavailable(format!("{}: {}", status, body)));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| WorldError::SynthesisUnavailable(format!("body read failed: {}", e)))?;
        if audio.is_empty() {
            return Err(WorldError::SynthesisUnavailable("empty audio response".to_string()));
        }
        debug!(bytes = audio.len(), "remote synthesis complete");
        Ok(audio.to_vec())
    }
}

struct LoadedEngine {
    engine: Arc<Mutex<TtsEngine>>,
    voices: Vec<String>,
}

/// Kokoro on-device speaker.
pub struct KokoroSpeaker {
    engine: OnceCell<LoadedEngine>,
    preferred_voice: Option<String>,
    rate: f32,
    sink: Arc<dyn AudioSink>,
}

impl KokoroSpeaker {
    pub fn new(sink: Arc<dyn AudioSink>, rate: f32, preferred_voice: Option<String>) -> Self {
        Self {
            engine: OnceCell::new(),
            preferred_voice,
            rate,
            sink,
        }
    }

    /// Load the engine once (downloads the model on first run).
    async fn loaded(&self) -> Result<&LoadedEngine, WorldError> {
        self.engine
            .get_or_try_init(|| async {
                let engine = TtsEngine::new().await.map_err(|e| {
                    WorldError::LocalSynthesisFailure(format!("Failed to initialize TTS: {}", e))
                })?;
                let voices = engine.voices();
                info!(voices = voices.len(), "local voices ready");
                Ok(LoadedEngine {
                    engine: Arc::new(Mutex::new(engine)),
                    voices,
                })
            })
            .await
    }
}

#[async_trait]
impl LocalSpeaker for KokoroSpeaker {
    async fn ensure_voices_ready(&self) -> Result<(), WorldError> {
        self.loaded().await.map(|_| ())
    }

    async fn voices(&self) -> Result<Vec<String>, WorldError> {
        Ok(self.loaded().await?.voices.clone())
    }

    async fn speak(
        &self,
        text: &str,
        locale: &str,
        cancel: &CancellationToken,
    ) -> Result<(), WorldError> {
        let loaded = self.loaded().await?;
        let voice = select_voice(&loaded.voices, locale, self.preferred_voice.as_deref())
            .ok_or_else(|| WorldError::LocalSynthesisFailure("no voices installed".to_string()))?;
        debug!(%voice, locale, "speaking locally");

        let chunks = split_into_chunks(text, MAX_CHUNK_CHARS);
        let engine = Arc::clone(&loaded.engine);
        let synthesis = tokio::task::spawn_blocking(move || {
            let mut engine = engine.lock().map_err(|_| {
                WorldError::LocalSynthesisFailure("engine lock poisoned".to_string())
            })?;
            let mut samples = Vec::new();
            for chunk in &chunks {
                let chunk_samples = engine
                    .synthesize(chunk, Some(voice.as_str()))
                    .map_err(|e| {
                        WorldError::LocalSynthesisFailure(format!("Synthesis failed: {}", e))
                    })?;
                samples.extend(chunk_samples);
                samples.extend(std::iter::repeat_n(0.0, CHUNK_PAUSE_SAMPLES));
            }
            Ok::<_, WorldError>(samples)
        });

        let samples = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            joined = synthesis => joined.map_err(|e| {
                WorldError::LocalSynthesisFailure(format!("synthesis task failed: {}", e))
            })??,
        };

        let wav = encode_wav(&adjust_audio_speed(samples, self.rate), SAMPLE_RATE)?;
        self.sink.play(wav, cancel).await
    }
}

/// Plays clips through an external player process, one file per clip.
pub struct CommandSink {
    program: String,
    args: Vec<String>,
}

impl CommandSink {
    /// `command[0]` is the program; `{file}` in any argument is replaced by
    /// the clip path, which is otherwise appended.
    pub fn new(command: &[String]) -> Result<Self, WorldError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| WorldError::ConfigError("player command is empty".to_string()))?;
        let mut args = args.to_vec();
        if !args.iter().any(|a| a.contains("{file}")) {
            args.push("{file}".to_string());
        }
        Ok(Self {
            program: program.clone(),
            args,
        })
    }
}

#[async_trait]
impl AudioSink for CommandSink {
    async fn play(&self, audio: Vec<u8>, cancel: &CancellationToken) -> Result<(), WorldError> {
        let suffix = if audio.starts_with(b"RIFF") { ".wav" } else { ".mp3" };
        let clip = tempfile::Builder::new()
            .prefix("worldchat-")
            .suffix(suffix)
            .tempfile()
            .map_err(|e| WorldError::Playback(format!("Failed to create clip file: {}", e)))?;
        tokio::fs::write(clip.path(), &audio)
            .await
            .map_err(|e| WorldError::Playback(format!("Failed to write clip: {}", e)))?;

        let path = clip.path().to_string_lossy().into_owned();
        let mut child = tokio::process::Command::new(&self.program)
            .args(self.args.iter().map(|a| a.replace("{file}", &path)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorldError::Playback(format!("Failed to start {}: {}", self.program, e)))?;

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("silencing player");
                let _ = child.kill().await;
                Ok(())
            }
            status = child.wait() => {
                let status = status
                    .map_err(|e| WorldError::Playback(format!("player failed: {}", e)))?;
                if status.success() {
                    Ok(())
                } else {
                    Err(WorldError::Playback(format!("player exited with {}", status)))
                }
            }
        }
    }
}

/// Locale a Kokoro voice speaks, from its language prefix (e.g. `bf_emma`).
fn voice_locale(voice: &str) -> Option<&'static str> {
    if voice.as_bytes().get(2) != Some(&b'_') {
        return None;
    }
    match voice.chars().next()? {
        'a' => Some("en-US"),
        'b' => Some("en-GB"),
        'e' => Some("es-ES"),
        'f' => Some("fr-FR"),
        'h' => Some("hi-IN"),
        'i' => Some("it-IT"),
        'j' => Some("ja-JP"),
        'p' => Some("pt-BR"),
        'z' => Some("zh-CN"),
        _ => None,
    }
}

fn primary_language(locale: &str) -> &str {
    locale.split(['-', '_']).next().unwrap_or(locale)
}

/// Pick the voice for `locale`: the preferred voice if installed, then an
/// exact locale match, then a primary-language match, then the first voice.
pub fn select_voice(voices: &[String], locale: &str, preferred: Option<&str>) -> Option<String> {
    if let Some(preferred) = preferred {
        if voices.iter().any(|v| v == preferred) {
            return Some(preferred.to_string());
        }
        warn!(voice = preferred, "preferred voice not installed");
    }

    let mut sorted: Vec<&String> = voices.iter().collect();
    sorted.sort();

    let exact = sorted
        .iter()
        .find(|v| voice_locale(v).is_some_and(|l| l.eq_ignore_ascii_case(locale)));
    let language = primary_language(locale);
    let same_language = || {
        sorted.iter().find(|v| {
            voice_locale(v).is_some_and(|l| primary_language(l).eq_ignore_ascii_case(language))
        })
    };

    if let Some(voice) = exact.or_else(same_language) {
        return Some(voice.to_string());
    }

    let fallback = sorted.first().map(|v| v.to_string());
    if let Some(ref voice) = fallback {
        warn!(locale, %voice, "no voice for locale, using first available");
    }
    fallback
}

/// Split text into sentence-aligned chunks of at most `max_chars` characters
/// where possible; over-long sentences are split at commas.
fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in text.split_inclusive(['.', '!', '?', ';']) {
        let pieces: Vec<&str> = if sentence.chars().count() > max_chars {
            sentence.split_inclusive(',').collect()
        } else {
            vec![sentence]
        };

        for piece in pieces {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            if !current.is_empty() && current.chars().count() + 1 + piece.chars().count() > max_chars
            {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(piece);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Change playback speed by linear interpolation. Rate < 1.0 is slower.
pub fn adjust_audio_speed(samples: Vec<f32>, rate: f32) -> Vec<f32> {
    if (rate - 1.0).abs() < 0.001 || rate <= 0.0 {
        return samples;
    }

    let new_len = (samples.len() as f32 / rate) as usize;
    (0..new_len)
        .filter_map(|i| {
            let pos = i as f32 * rate;
            let idx = pos as usize;
            let frac = pos - idx as f32;
            match (samples.get(idx), samples.get(idx + 1)) {
                (Some(a), Some(b)) => Some(a * (1.0 - frac) + b * frac),
                (Some(a), None) => Some(*a),
                _ => None,
            }
        })
        .collect()
}

/// Encode mono samples as a 16-bit PCM WAV file in memory.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, WorldError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let encode_err = |e: hound::Error| WorldError::LocalSynthesisFailure(format!("WAV encoding failed: {}", e));

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(encode_err)?;
        for sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(value).map_err(encode_err)?;
        }
        writer.finalize().map_err(encode_err)?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_select_voice_prefers_configured() {
        let installed = strings(&["af_sky", "bm_george", "ff_siwis"]);
        assert_eq!(
            select_voice(&installed, "fr-FR", Some("bm_george")).as_deref(),
            Some("bm_george")
        );
        assert_eq!(
            select_voice(&installed, "fr-FR", Some("missing")).as_deref(),
            Some("ff_siwis")
        );
    }

    #[test]
    fn test_select_voice_by_locale() {
        let installed = strings(&["bm_george", "af_sky", "am_adam", "bf_emma"]);
        assert_eq!(select_voice(&installed, "en-GB", None).as_deref(), Some("bf_emma"));
        assert_eq!(select_voice(&installed, "en-us", None).as_deref(), Some("af_sky"));
        // Same language, different region.
        assert_eq!(select_voice(&installed, "en-AU", None).as_deref(), Some("af_sky"));
        // Unsupported language falls back to the first voice.
        assert_eq!(select_voice(&installed, "he-IL", None).as_deref(), Some("af_sky"));
        assert_eq!(select_voice(&[], "he-IL", None), None);
    }

    #[test]
    fn test_split_into_chunks() {
        let chunks = split_into_chunks("Hello world. This is a test. Another sentence here.", 30);
        assert_eq!(chunks, vec!["Hello world. This is a test.", "Another sentence here."]);

        let long = "one, two, three, four, five, six, seven, eight, nine, ten.";
        for chunk in split_into_chunks(long, 20) {
            assert!(chunk.chars().count() <= 20, "{}", chunk);
        }
        assert!(split_into_chunks("   ", 20).is_empty());
    }

    #[test]
    fn test_split_counts_characters_not_bytes() {
        let hebrew = "שלום לכולם. מה שלומכם היום?";
        assert_eq!(split_into_chunks(hebrew, 30).len(), 1);
    }

    #[test]
    fn test_adjust_audio_speed() {
        let samples = vec![0.0, 1.0, 0.0, 1.0];
        assert_eq!(adjust_audio_speed(samples.clone(), 1.0), samples);
        assert_eq!(adjust_audio_speed(samples.clone(), 2.0).len(), 2);
        let slower = adjust_audio_speed(samples, 0.5);
        assert_eq!(slower.len(), 8);
        assert_eq!(slower[1], 0.5);
    }

    #[test]
    fn test_encode_wav_header_and_length() {
        let wav = encode_wav(&[0.0, 0.5, -0.5, 2.0], SAMPLE_RATE).unwrap();
        assert!(wav.starts_with(b"RIFF"));
        assert_eq!(&wav[8..12], b"WAVE");

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, vec![0, 16383, -16383, i16::MAX]);
    }

    #[test]
    fn test_elevenlabs_request_shape() {
        let synth = ElevenLabsSynthesizer::new(RemoteVoiceConfig::default(), Some("k".into()));
        assert_eq!(
            synth.endpoint(),
            "https://api.elevenlabs.io/v1/text-to-speech/pNInz6obpgDQGcFmaJgB"
        );
        let body = synth.request_body("שלום");
        assert_eq!(body["text"], "שלום");
        assert_eq!(body["model_id"], "eleven_multilingual_v2");
        assert_eq!(body["voice_settings"]["stability"], 0.5);
        assert_eq!(body["voice_settings"]["similarity_boost"], 0.75);
    }

    #[tokio::test]
    async fn test_elevenlabs_without_key_is_unavailable() {
        let synth = ElevenLabsSynthesizer::new(RemoteVoiceConfig::default(), Some("  ".into()));
        assert!(matches!(
            synth.synthesize("hi").await,
            Err(WorldError::SynthesisUnavailable(_))
        ));
    }

    #[test]
    fn test_command_sink_requires_program() {
        assert!(CommandSink::new(&[]).is_err());
        let sink = CommandSink::new(&["aplay".to_string()]).unwrap();
        assert_eq!(sink.args, vec!["{file}"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_sink_plays_file() {
        let command = strings(&["sh", "-c", "test -s \"$0\"", "{file}"]);
        let sink = CommandSink::new(&command).unwrap();
        sink.play(b"ID3 audio".to_vec(), &CancellationToken::new())
            .await
            .unwrap();

        let failing = CommandSink::new(&strings(&["false"])).unwrap();
        assert!(matches!(
            failing.play(b"x".to_vec(), &CancellationToken::new()).await,
            Err(WorldError::Playback(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_sink_cancel_kills_player() {
        let sink = CommandSink::new(&strings(&["sh", "-c", "sleep 30", "{file}"])).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        sink.play(b"x".to_vec(), &cancel).await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
