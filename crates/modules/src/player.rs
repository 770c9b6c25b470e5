//! Music playback module.
//!
//! Drives a streaming-music service over its REST API: natural-language
//! play requests are resolved against the user's liked tracks and a fuzzy
//! search of the service catalog, playlists are matched by name, and
//! playback controls map straight to API calls.
//!
//! Playback calls can fail because no playback device is active. Those go
//! through the delegated-activation wrapper: the client is asked to start
//! its embedded player (`INIT_PLAYER`), the module waits for the
//! `PLAYER_READY` transport message, and the call is retried once.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use murmur_core::error::ModuleError;
use murmur_core::message::Message;
use murmur_core::module::{
    Capability, CapabilityModule, ModuleContext, ToolReply, arg_bool_opt, arg_str,
};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::activation::{ActivationFailure, ActivationGate, ActivationPolicy, run_with_activation};

static CAPS: &[Capability] = &[
    Capability::new(
        "play",
        &["string_query", "should_queue"],
        "Plays a song, album, or artist based on a search query. This takes natural language input. For example, \"wildfire\", \"the song wildfire\", and \"the song wildfire by Jeremy Zucker\" are all valid inputs. This will play tracks, albums, or artists. It will not play playlists.",
    ),
    Capability::new(
        "play_playlist",
        &["playlist_name"],
        "Plays a playlist based on a fuzzy search of the playlist name. To play liked songs, use the query \"liked-tracks\".",
    ),
    Capability::new(
        "get_current_playback",
        &[],
        "Retrieves information about the currently playing track, or \"what song is currently playing\".",
    ),
    Capability::new(
        "control_playback",
        &["action"],
        "Controls playback. Action can be one of the following: \"play\", \"pause\", \"next\", \"previous\", \"shuffle\", \"noshuffle\".",
    ),
    Capability::new(
        "like_current_song",
        &[],
        "Likes the currently playing song.",
    ),
];

/// Minimum normalized match score for a search candidate to count.
const MIN_MATCH_SCORE: i64 = 50;
/// Score boost for tracks already in the user's liked songs.
const LIKED_BOOST: i64 = 20;
/// How many liked tracks to sample when playing "liked-tracks".
const LIKED_SAMPLE: usize = 100;

pub struct PlayerModule {
    ctx: ModuleContext,
    http: reqwest::Client,
    gate: ActivationGate,
    policy: ActivationPolicy,
    state: tokio::sync::Mutex<PlayerState>,
}

#[derive(Default)]
struct PlayerState {
    client_id: String,
    client_secret: String,
    api_base: String,
    token_url: String,
    tokens: Option<Tokens>,
    logged_in: bool,
    liked: HashMap<String, Track>,
    playlists: Vec<Playlist>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tokens {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Absolute expiry, seconds since the epoch.
    #[serde(default)]
    expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Track {
    name: String,
    uri: String,
    artists: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Playlist {
    name: String,
    uri: String,
}

/// Failures from the streaming service API.
#[derive(Debug, Clone, PartialEq)]
enum ServiceError {
    NoActiveDevice,
    Api { status: u16, message: String },
    Network(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::NoActiveDevice => write!(f, "no active playback device"),
            ServiceError::Api { status, message } => {
                write!(f, "service returned {status}: {message}")
            }
            ServiceError::Network(e) => write!(f, "network error: {e}"),
        }
    }
}

impl PlayerModule {
    pub fn new(ctx: ModuleContext) -> Self {
        let policy = ActivationPolicy::from(&ctx.tuning);
        Self {
            ctx,
            http: reqwest::Client::new(),
            gate: ActivationGate::new(),
            policy,
            state: tokio::sync::Mutex::new(PlayerState::default()),
        }
    }

    // --- Authentication ---

    /// Exchange the stored refresh token for a fresh access token.
    async fn refresh_tokens(&self, state: &mut PlayerState) {
        state.logged_in = false;
        let Some(tokens) = &state.tokens else {
            return;
        };
        let Some(refresh_token) = tokens.refresh_token.clone() else {
            return;
        };
        if state.token_url.is_empty() || state.client_id.is_empty() {
            return;
        }

        let authorization =
            BASE64.encode(format!("{}:{}", state.client_id, state.client_secret));
        let response = self
            .http
            .post(&state.token_url)
            .header("Authorization", format!("Basic {authorization}"))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", state.client_id.as_str()),
            ])
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().as_u16() == 200 => r,
            Ok(r) => {
                warn!(status = r.status().as_u16(), "Token refresh rejected");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                return;
            }
        };

        let body: Value = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Unreadable token response");
                return;
            }
        };
        let Some(access_token) = body["access_token"].as_str() else {
            return;
        };
        let expires_in = body["expires_in"].as_i64().unwrap_or(3_600);

        let tokens = Tokens {
            access_token: access_token.to_string(),
            // The service may rotate the refresh token; keep the old one
            // when it does not.
            refresh_token: body["refresh_token"]
                .as_str()
                .map(str::to_string)
                .or(Some(refresh_token)),
            expires_at: chrono::Utc::now().timestamp() + expires_in,
        };
        self.settings()
            .save("tokens", &serde_json::to_value(&tokens).unwrap_or_default());
        state.tokens = Some(tokens);
        state.logged_in = true;
        debug!("Service tokens refreshed");
    }

    /// Check login and proactively refresh a token that is about to
    /// expire. Returns a usable access token.
    async fn ensure_authenticated(&self) -> Result<String, ModuleError> {
        let mut state = self.state.lock().await;
        let not_authenticated =
            || ModuleError::NotAuthenticated("not logged in to the streaming service".into());

        if !state.logged_in {
            return Err(not_authenticated());
        }
        let margin = self.ctx.tuning.token_refresh_margin_secs;
        let expiring = state
            .tokens
            .as_ref()
            .is_none_or(|t| needs_refresh(t.expires_at, chrono::Utc::now().timestamp(), margin));
        if expiring {
            self.refresh_tokens(&mut state).await;
            if !state.logged_in {
                return Err(not_authenticated());
            }
        }
        Ok(state
            .tokens
            .as_ref()
            .map(|t| t.access_token.clone())
            .unwrap_or_default())
    }

    fn settings(&self) -> murmur_core::settings::ScopedSettings {
        self.ctx.settings.scoped(&self.ctx.user_id, self.name())
    }

    // --- Service API ---

    async fn api(
        &self,
        token: &str,
        method: reqwest::Method,
        path_and_query: String,
        body: Option<Value>,
    ) -> Result<Value, ServiceError> {
        let api_base = self.state.lock().await.api_base.clone();
        let url = format!("{}{}", api_base.trim_end_matches('/'), path_and_query);
        let mut builder = self
            .http
            .request(method, &url)
            .header("Authorization", format!("Bearer {token}"));
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        if status == 204 {
            return Ok(Value::Null);
        }
        let text = response.text().await.unwrap_or_default();
        if status >= 400 {
            let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            if body["error"]["reason"] == "NO_ACTIVE_DEVICE" {
                return Err(ServiceError::NoActiveDevice);
            }
            return Err(ServiceError::Api {
                status,
                message: text,
            });
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ServiceError::Api {
            status,
            message: format!("unreadable response: {e}"),
        })
    }

    /// Run a playback call under the delegated-activation policy: if no
    /// device is active, ask the client to start one and retry once after
    /// it reports ready.
    async fn playback_call<F, Fut>(&self, function: &str, op: F) -> Result<Value, ModuleError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, ServiceError>>,
    {
        let result = run_with_activation(
            &self.gate,
            &self.policy,
            |e| matches!(e, ServiceError::NoActiveDevice),
            || async {
                self.ctx
                    .send_tool_message(self.name(), json!({"message": "INIT_PLAYER"}))
                    .await;
            },
            op,
        )
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(ActivationFailure::Exhausted) => Err(ModuleError::ActivationTimeout(
                "the playback device did not come online".into(),
            )),
            Err(ActivationFailure::Failed(e)) => Err(ModuleError::ExecutionFailed {
                module: self.name().into(),
                function: function.into(),
                reason: e.to_string(),
            }),
        }
    }

    async fn start_playback(&self, token: &str, body: Value) -> Result<Value, ModuleError> {
        self.playback_call("play", || {
            self.api(
                token,
                reqwest::Method::PUT,
                "/me/player/play".to_string(),
                Some(body.clone()),
            )
        })
        .await
    }

    async fn queue_tracks(&self, token: &str, uris: &[String]) -> Result<(), ModuleError> {
        for uri in uris {
            let path = format!("/me/player/queue?uri={uri}");
            self.playback_call("play", || {
                self.api(token, reqwest::Method::POST, path.clone(), None)
            })
            .await?;
        }
        Ok(())
    }

    // --- Library caches ---

    /// Pull the user's saved tracks until the cache catches up.
    async fn update_liked_cache(&self, token: &str) {
        let mut liked = self.state.lock().await.liked.clone();
        let mut offset = 0;
        loop {
            let page = match self
                .api(
                    token,
                    reqwest::Method::GET,
                    format!("/me/tracks?limit=50&offset={offset}"),
                    None,
                )
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "Liked-tracks sync failed");
                    return;
                }
            };
            let items = page["items"].as_array().cloned().unwrap_or_default();
            let mut caught_up = false;
            for item in &items {
                let Some(track) = parse_track(&item["track"]) else {
                    continue;
                };
                if liked.contains_key(&track.uri) {
                    caught_up = true;
                    break;
                }
                liked.insert(track.uri.clone(), track);
            }
            if caught_up || items.len() < 50 {
                break;
            }
            offset += 50;
        }

        self.settings().save(
            "liked_tracks_cache",
            &serde_json::to_value(&liked).unwrap_or_default(),
        );
        self.state.lock().await.liked = liked;
    }

    async fn update_playlists_cache(&self, token: &str) {
        let mut playlists = Vec::new();
        let mut offset = 0;
        loop {
            let page = match self
                .api(
                    token,
                    reqwest::Method::GET,
                    format!("/me/playlists?limit=50&offset={offset}"),
                    None,
                )
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "Playlist sync failed");
                    return;
                }
            };
            let items = page["items"].as_array().cloned().unwrap_or_default();
            for item in &items {
                if let (Some(name), Some(uri)) = (item["name"].as_str(), item["uri"].as_str()) {
                    playlists.push(Playlist {
                        name: name.to_string(),
                        uri: uri.to_string(),
                    });
                }
            }
            if items.len() < 50 {
                break;
            }
            offset += 50;
        }

        self.settings().save(
            "playlists_cache",
            &serde_json::to_value(&playlists).unwrap_or_default(),
        );
        self.state.lock().await.playlists = playlists;
    }

    // --- Operations ---

    async fn play(&self, args: &Value) -> Result<Value, ModuleError> {
        let query = arg_str(args, "string_query")?;
        let should_queue = arg_bool_opt(args, "should_queue").unwrap_or(false);
        let token = self.ensure_authenticated().await?;

        // Exact liked-track match first: cheapest and usually right.
        let liked_hit = {
            let state = self.state.lock().await;
            state
                .liked
                .values()
                .find(|t| t.name.eq_ignore_ascii_case(&query))
                .cloned()
        };
        if let Some(track) = liked_hit {
            if should_queue {
                self.queue_tracks(&token, std::slice::from_ref(&track.uri))
                    .await?;
            } else {
                self.start_playback(&token, json!({"uris": [track.uri.clone()]}))
                    .await?;
            }
            return Ok(json!({
                "status": "playing",
                "item": format!("{} (track) by {}", track.name, track.artists.first().cloned().unwrap_or_default()),
            }));
        }

        let results = self
            .api(
                &token,
                reqwest::Method::GET,
                format!(
                    "/search?q={}&type=track,album,artist&limit=10",
                    urlencode(&query)
                ),
                None,
            )
            .await
            .map_err(|e| ModuleError::ExecutionFailed {
                module: self.name().into(),
                function: "play".into(),
                reason: e.to_string(),
            })?;

        let candidates = parse_search_results(&results);
        let liked_uris: Vec<String> = {
            let state = self.state.lock().await;
            state.liked.keys().cloned().collect()
        };
        let (best, score) = rank_candidates(&query, &candidates, &liked_uris);

        if best.is_empty() || score < MIN_MATCH_SCORE {
            return Ok(json!({"error": format!("No results found for '{query}'")}));
        }
        if best.len() > 1 {
            // The tool cannot disambiguate: hand the alternatives to the
            // model and end the run with a spoken summary.
            let options: Vec<String> = best.iter().map(natural_language).collect();
            let spoken = ambiguity_summary(&best);
            return Ok(return_ambiguous(&query, options, spoken));
        }

        let chosen = &best[0];
        let uris = self.resolve_uris(&token, chosen).await?;
        if should_queue {
            self.queue_tracks(&token, &uris).await?;
        } else {
            self.start_playback(&token, json!({"uris": uris})).await?;
        }

        let mut item = format!("{} ({})", chosen.name, chosen.kind.as_str());
        if chosen.kind != CandidateKind::Artist {
            if let Some(artist) = chosen.artists.first() {
                item.push_str(&format!(" by {artist}"));
            }
        }
        Ok(json!({"status": "playing", "item": item}))
    }

    /// Expand a chosen candidate into the track uris to play.
    async fn resolve_uris(
        &self,
        token: &str,
        candidate: &Candidate,
    ) -> Result<Vec<String>, ModuleError> {
        let fetch = |path: String, key: &'static str| async move {
            let body = self
                .api(token, reqwest::Method::GET, path, None)
                .await
                .map_err(|e| ModuleError::ExecutionFailed {
                    module: "player".into(),
                    function: "play".into(),
                    reason: e.to_string(),
                })?;
            Ok::<Vec<String>, ModuleError>(
                body[key]
                    .as_array()
                    .map(|tracks| {
                        tracks
                            .iter()
                            .filter_map(|t| t["uri"].as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
            )
        };

        match candidate.kind {
            CandidateKind::Track => Ok(vec![candidate.uri.clone()]),
            CandidateKind::Album => {
                fetch(format!("/albums/{}/tracks", candidate.id), "items").await
            }
            CandidateKind::Artist => {
                fetch(format!("/artists/{}/top-tracks", candidate.id), "tracks").await
            }
        }
    }

    async fn play_playlist(&self, args: &Value) -> Result<Value, ModuleError> {
        let playlist_name = arg_str(args, "playlist_name")?;
        let token = self.ensure_authenticated().await?;

        if playlist_name.eq_ignore_ascii_case("liked-tracks") {
            let mut uris: Vec<String> = {
                let state = self.state.lock().await;
                state.liked.keys().cloned().collect()
            };
            uris.shuffle(&mut rand::rng());
            uris.truncate(LIKED_SAMPLE);
            if uris.is_empty() {
                return Ok(json!({"error": "No liked tracks available"}));
            }
            self.start_playback(&token, json!({"uris": uris})).await?;
            return Ok(json!({"status": "playing", "item": "liked-tracks"}));
        }

        let playlists = self.state.lock().await.playlists.clone();
        let Some(best) = best_playlist(&playlist_name, &playlists) else {
            return Ok(json!({"error": format!("No playlists found matching '{playlist_name}'")}));
        };
        self.start_playback(&token, json!({"context_uri": best.uri}))
            .await?;
        Ok(json!({"status": "playing", "item": format!("playlist '{}'", best.name)}))
    }

    async fn get_current_playback(&self) -> Result<Value, ModuleError> {
        let token = self.ensure_authenticated().await?;
        let playback = self
            .api(&token, reqwest::Method::GET, "/me/player".to_string(), None)
            .await
            .map_err(|e| ModuleError::ExecutionFailed {
                module: self.name().into(),
                function: "get_current_playback".into(),
                reason: e.to_string(),
            })?;

        if playback.is_null() || playback["item"].is_null() {
            return Ok(json!({"status": "no_song_playing"}));
        }
        let progress = playback["progress_ms"].as_f64().unwrap_or(0.0);
        let duration = playback["item"]["duration_ms"].as_f64().unwrap_or(1.0);
        Ok(json!({
            "track_name": playback["item"]["name"],
            "artist_name": playback["item"]["artists"][0]["name"],
            "album_name": playback["item"]["album"]["name"],
            "is_paused": !playback["is_playing"].as_bool().unwrap_or(false),
            "is_shuffling": playback["shuffle_state"].as_bool().unwrap_or(false),
            "completion_amount": progress / duration.max(1.0),
        }))
    }

    async fn control_playback(&self, args: &Value) -> Result<Value, ModuleError> {
        let action = arg_str(args, "action")?;
        let token = self.ensure_authenticated().await?;

        let (method, path) = match action.as_str() {
            "play" => (reqwest::Method::PUT, "/me/player/play"),
            "pause" => (reqwest::Method::PUT, "/me/player/pause"),
            "next" => (reqwest::Method::POST, "/me/player/next"),
            "previous" => (reqwest::Method::POST, "/me/player/previous"),
            "shuffle" => (reqwest::Method::PUT, "/me/player/shuffle?state=true"),
            "noshuffle" => (reqwest::Method::PUT, "/me/player/shuffle?state=false"),
            other => {
                return Ok(json!({"error": format!("Unknown playback action '{other}'")}));
            }
        };
        self.playback_call("control_playback", || {
            self.api(&token, method.clone(), path.to_string(), None)
        })
        .await?;
        Ok(Value::Null)
    }

    async fn like_current_song(&self) -> Result<Value, ModuleError> {
        let token = self.ensure_authenticated().await?;
        let playback = self
            .api(&token, reqwest::Method::GET, "/me/player".to_string(), None)
            .await
            .map_err(|e| ModuleError::ExecutionFailed {
                module: self.name().into(),
                function: "like_current_song".into(),
                reason: e.to_string(),
            })?;
        if playback.is_null() || playback["item"].is_null() {
            return Ok(json!({"error": "No song is currently playing"}));
        }

        let id = playback["item"]["id"].as_str().unwrap_or_default();
        self.api(
            &token,
            reqwest::Method::PUT,
            "/me/tracks".to_string(),
            Some(json!({"ids": [id]})),
        )
        .await
        .map_err(|e| ModuleError::ExecutionFailed {
            module: self.name().into(),
            function: "like_current_song".into(),
            reason: e.to_string(),
        })?;
        self.update_liked_cache(&token).await;

        Ok(json!({
            "status": "liked",
            "item": format!(
                "{} by {}",
                playback["item"]["name"].as_str().unwrap_or_default(),
                playback["item"]["artists"][0]["name"].as_str().unwrap_or_default(),
            ),
        }))
    }
}

// --- Pure helpers ---

fn needs_refresh(expires_at: i64, now: i64, margin_secs: i64) -> bool {
    expires_at < now + margin_secs
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateKind {
    Track,
    Album,
    Artist,
}

impl CandidateKind {
    fn as_str(&self) -> &'static str {
        match self {
            CandidateKind::Track => "track",
            CandidateKind::Album => "album",
            CandidateKind::Artist => "artist",
        }
    }

    /// How the kind is spoken: "track" reads as "song".
    fn spoken(&self) -> &'static str {
        match self {
            CandidateKind::Track => "song",
            CandidateKind::Album => "album",
            CandidateKind::Artist => "artist",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    kind: CandidateKind,
    name: String,
    id: String,
    uri: String,
    artists: Vec<String>,
}

fn parse_track(item: &Value) -> Option<Track> {
    Some(Track {
        name: item["name"].as_str()?.to_string(),
        uri: item["uri"].as_str()?.to_string(),
        artists: item["artists"]
            .as_array()
            .map(|artists| {
                artists
                    .iter()
                    .filter_map(|a| a["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
    })
}

/// Flatten a catalog search response into candidates, de-duplicated by
/// their natural-language description.
fn parse_search_results(results: &Value) -> Vec<Candidate> {
    let sections = [
        ("tracks", CandidateKind::Track),
        ("albums", CandidateKind::Album),
        ("artists", CandidateKind::Artist),
    ];
    let mut candidates = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (section, kind) in sections {
        let Some(items) = results[section]["items"].as_array() else {
            continue;
        };
        for item in items {
            if item.is_null() {
                continue;
            }
            let (Some(name), Some(id), Some(uri)) = (
                item["name"].as_str(),
                item["id"].as_str(),
                item["uri"].as_str(),
            ) else {
                continue;
            };
            let candidate = Candidate {
                kind,
                name: name.to_string(),
                id: id.to_string(),
                uri: uri.to_string(),
                artists: item["artists"]
                    .as_array()
                    .map(|artists| {
                        artists
                            .iter()
                            .filter_map(|a| a["name"].as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            if seen.insert(natural_language(&candidate).to_lowercase()) {
                candidates.push(candidate);
            }
        }
    }
    candidates
}

/// Normalize a catalog name for matching: drop parentheticals, spell out
/// "&", lowercase, strip punctuation, collapse whitespace.
fn clean_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut depth = 0usize;
    for c in name.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    let out = out.replace('&', "and").to_lowercase();
    let cleaned: String = out
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ')
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The phrasings a user might have used to ask for this item.
fn build_utterances(candidate: &Candidate) -> Vec<String> {
    let kind = candidate.kind.spoken();
    let name = clean_name(&candidate.name);
    let mut utterances = vec![name.clone(), format!("the {kind} {name}")];
    if candidate.kind != CandidateKind::Artist {
        if let Some(artist) = candidate.artists.first() {
            utterances.push(format!("{name} by {artist}"));
            utterances.push(format!("the {kind} {name} by {artist}"));
        }
    }
    utterances
}

/// "song wildfire by Jeremy Zucker" — the canonical description used for
/// de-duplication and the ambiguity option list.
fn natural_language(candidate: &Candidate) -> String {
    let mut s = format!("{} {}", candidate.kind.spoken(), clean_name(&candidate.name));
    if candidate.kind != CandidateKind::Artist {
        if let Some(artist) = candidate.artists.first() {
            s.push_str(&format!(" by {artist}"));
        }
    }
    s
}

/// Score `query` against one utterance, normalized to 0–100 against the
/// query's self-match so the liked-track boost and threshold stay on a
/// stable scale.
fn match_score(matcher: &SkimMatcherV2, query: &str, utterance: &str) -> i64 {
    let self_score = matcher.fuzzy_match(query, query).unwrap_or(1).max(1);
    let score = matcher.fuzzy_match(utterance, query).unwrap_or(0);
    (score * 100 / self_score).min(100)
}

/// Rank candidates against the query. Returns every candidate tied for
/// the best score (after de-prioritizing artists, then albums, on ties)
/// plus the score itself.
fn rank_candidates(
    query: &str,
    candidates: &[Candidate],
    liked_uris: &[String],
) -> (Vec<Candidate>, i64) {
    let matcher = SkimMatcherV2::default();
    let query = query.to_lowercase();
    let mut best: Vec<Candidate> = Vec::new();
    let mut best_score = 0;

    for candidate in candidates {
        for utterance in build_utterances(candidate) {
            let mut score = match_score(&matcher, &query, &utterance.to_lowercase());
            if candidate.kind == CandidateKind::Track
                && liked_uris.iter().any(|uri| *uri == candidate.uri)
            {
                score += LIKED_BOOST;
            }
            if score > best_score {
                best_score = score;
                best = vec![candidate.clone()];
            } else if score == best_score && score > 0 && !best.contains(candidate) {
                best.push(candidate.clone());
            }
        }
    }

    if best.len() > 1 {
        let non_artists: Vec<Candidate> = best
            .iter()
            .filter(|c| c.kind != CandidateKind::Artist)
            .cloned()
            .collect();
        if !non_artists.is_empty() {
            best = non_artists;
        }
    }
    if best.len() > 1 {
        let non_albums: Vec<Candidate> = best
            .iter()
            .filter(|c| c.kind != CandidateKind::Album)
            .cloned()
            .collect();
        if !non_albums.is_empty() {
            best = non_albums;
        }
    }

    (best, best_score)
}

/// Spoken summary of ambiguous matches, grouped by title.
fn ambiguity_summary(candidates: &[Candidate]) -> String {
    let mut order: Vec<String> = Vec::new();
    let mut by_name: HashMap<String, Vec<String>> = HashMap::new();
    for candidate in candidates {
        let key = candidate.name.to_lowercase();
        if !by_name.contains_key(&key) {
            order.push(key.clone());
        }
        by_name
            .entry(key)
            .or_default()
            .push(candidate.artists.first().cloned().unwrap_or_default());
    }

    let phrases: Vec<String> = order
        .iter()
        .map(|name| {
            let artists = &by_name[name];
            let title = title_case(name);
            match artists.len() {
                1 => format!("{title} by {}", artists[0]),
                2 => format!("{title} by {} and by {}", artists[0], artists[1]),
                n => {
                    let head = artists[..n - 1].join(", by ");
                    format!("{title} by {head}, and by {}", artists[n - 1])
                }
            }
        })
        .collect();

    format!("There are multiple options. {}.", phrases.join(". And "))
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the ambiguity reply: a structured error payload for the model,
/// plus extras that speak the options and end the run.
fn return_ambiguous(query: &str, options: Vec<String>, spoken: String) -> Value {
    // The caller wraps this into a ToolReply with extras; kept separate so
    // the payload shape is testable on its own.
    json!({
        "error": format!("Multiple results found for '{query}'"),
        "options": options,
        "spoken": spoken,
    })
}

fn best_playlist<'a>(query: &str, playlists: &'a [Playlist]) -> Option<&'a Playlist> {
    let matcher = SkimMatcherV2::default();
    playlists
        .iter()
        .map(|p| {
            (
                match_score(&matcher, &query.to_lowercase(), &p.name.to_lowercase()),
                p,
            )
        })
        .filter(|(score, _)| *score > 0)
        .max_by_key(|(score, _)| *score)
        .map(|(_, p)| p)
}

#[async_trait]
impl CapabilityModule for PlayerModule {
    fn name(&self) -> &'static str {
        "player"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPS
    }

    async fn setup(&self) {
        let settings = self.settings();
        let api = settings.load(
            "service_api",
            json!({
                "client_id": "",
                "client_secret": "",
                "api_base": "https://api.spotify.com/v1",
                "token_url": "https://accounts.spotify.com/api/token",
            }),
        );
        let tokens: Option<Tokens> =
            serde_json::from_value(settings.load("tokens", json!({}))).ok();
        let liked: HashMap<String, Track> =
            serde_json::from_value(settings.load("liked_tracks_cache", json!({})))
                .unwrap_or_default();
        let playlists: Vec<Playlist> =
            serde_json::from_value(settings.load("playlists_cache", json!([])))
                .unwrap_or_default();

        let mut state = self.state.lock().await;
        state.client_id = api["client_id"].as_str().unwrap_or_default().to_string();
        state.client_secret = api["client_secret"].as_str().unwrap_or_default().to_string();
        state.api_base = api["api_base"].as_str().unwrap_or_default().to_string();
        state.token_url = api["token_url"].as_str().unwrap_or_default().to_string();
        state.tokens = tokens;
        state.liked = liked;
        state.playlists = playlists;

        self.refresh_tokens(&mut state).await;
        let (logged_in, token) = (
            state.logged_in,
            state
                .tokens
                .as_ref()
                .map(|t| t.access_token.clone())
                .unwrap_or_default(),
        );
        drop(state);

        if logged_in {
            self.update_liked_cache(&token).await;
            self.update_playlists_cache(&token).await;
        }
    }

    async fn invoke(&self, function: &str, args: Value) -> Result<ToolReply, ModuleError> {
        match function {
            "play" => {
                let mut value = self.play(&args).await?;
                // Ambiguous results carry their own speech and run
                // termination as extras.
                let spoken = value
                    .as_object_mut()
                    .and_then(|obj| obj.remove("spoken"))
                    .and_then(|v| v.as_str().map(str::to_string));
                match spoken {
                    Some(spoken) => Ok(ToolReply::with_extras(
                        value,
                        vec![Message::assistant(spoken), Message::end()],
                    )),
                    None => Ok(ToolReply::value(value)),
                }
            }
            "play_playlist" => Ok(ToolReply::value(self.play_playlist(&args).await?)),
            "get_current_playback" => Ok(ToolReply::value(self.get_current_playback().await?)),
            "control_playback" => Ok(ToolReply::value(self.control_playback(&args).await?)),
            "like_current_song" => Ok(ToolReply::value(self.like_current_song().await?)),
            other => Err(ModuleError::FunctionNotFound {
                module: self.name().into(),
                function: other.into(),
            }),
        }
    }

    async fn on_transport_message(&self, payload: Value) {
        if payload["message"] == "PLAYER_READY" {
            debug!("Playback device reported ready");
            self.gate.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn track(name: &str, uri: &str, artist: &str) -> Candidate {
        Candidate {
            kind: CandidateKind::Track,
            name: name.into(),
            id: uri.rsplit(':').next().unwrap_or_default().into(),
            uri: uri.into(),
            artists: vec![artist.into()],
        }
    }

    #[test]
    fn clean_name_normalizes_catalog_titles() {
        assert_eq!(clean_name("Wildfire (feat. Someone)"), "wildfire");
        assert_eq!(clean_name("Beauty & The Beast"), "beauty and the beast");
        assert_eq!(clean_name("  What's  Up?! "), "whats up");
    }

    #[test]
    fn utterances_cover_bare_and_attributed_forms() {
        let c = track("Wildfire", "svc:track:1", "Jeremy Zucker");
        let utterances = build_utterances(&c);
        assert!(utterances.contains(&"wildfire".to_string()));
        assert!(utterances.contains(&"the song wildfire".to_string()));
        assert!(utterances.contains(&"wildfire by Jeremy Zucker".to_string()));
        assert!(utterances.contains(&"the song wildfire by Jeremy Zucker".to_string()));

        let artist = Candidate {
            kind: CandidateKind::Artist,
            name: "Jeremy Zucker".into(),
            id: "a1".into(),
            uri: "svc:artist:a1".into(),
            artists: vec![],
        };
        assert_eq!(build_utterances(&artist).len(), 2);
    }

    #[test]
    fn ranking_prefers_the_matching_track() {
        let candidates = vec![
            track("Wildfire", "svc:track:1", "Jeremy Zucker"),
            track("Campfire", "svc:track:2", "Someone Else"),
        ];
        let (best, score) = rank_candidates("wildfire", &candidates, &[]);
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].name, "Wildfire");
        assert!(score >= MIN_MATCH_SCORE);
    }

    #[test]
    fn liked_tracks_outrank_identical_scores() {
        let candidates = vec![
            track("Wildfire", "svc:track:1", "Jeremy Zucker"),
            track("Wildfire", "svc:track:2", "Cover Band"),
        ];
        let liked = vec!["svc:track:2".to_string()];
        let (best, _) = rank_candidates("wildfire", &candidates, &liked);
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].uri, "svc:track:2");
    }

    #[test]
    fn ties_drop_artists_before_albums() {
        let same_name = |kind, uri: &str| Candidate {
            kind,
            name: "Echoes".into(),
            id: uri.into(),
            uri: uri.into(),
            artists: vec!["Band".into()],
        };
        let candidates = vec![
            same_name(CandidateKind::Artist, "a"),
            same_name(CandidateKind::Album, "b"),
            same_name(CandidateKind::Track, "c"),
        ];
        let (best, _) = rank_candidates("echoes by Band", &candidates, &[]);
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].kind, CandidateKind::Track);
    }

    #[test]
    fn no_plausible_match_scores_below_threshold() {
        let candidates = vec![track("Completely Unrelated", "svc:track:9", "Nobody")];
        let (_, score) = rank_candidates("wildfire", &candidates, &[]);
        assert!(score < MIN_MATCH_SCORE);
    }

    #[test]
    fn search_results_deduplicate_by_description() {
        let body = json!({
            "tracks": {"items": [
                {"name": "Echo", "id": "1", "uri": "svc:track:1", "artists": [{"name": "A"}]},
                {"name": "Echo", "id": "2", "uri": "svc:track:2", "artists": [{"name": "A"}]},
                null,
            ]},
            "artists": {"items": [
                {"name": "Echo", "id": "3", "uri": "svc:artist:3"},
            ]},
        });
        let candidates = parse_search_results(&body);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].kind, CandidateKind::Track);
        assert_eq!(candidates[1].kind, CandidateKind::Artist);
    }

    #[test]
    fn ambiguity_summary_groups_artists_by_title() {
        let candidates = vec![
            track("Wildfire", "svc:track:1", "Jeremy Zucker"),
            track("Wildfire", "svc:track:2", "SBTRKT"),
        ];
        let spoken = ambiguity_summary(&candidates);
        assert!(spoken.starts_with("There are multiple options."));
        assert!(spoken.contains("Wildfire by Jeremy Zucker and by SBTRKT"));
    }

    #[test]
    fn token_refresh_margin() {
        assert!(needs_refresh(1_000, 950, 60));
        assert!(!needs_refresh(1_000, 900, 60));
        assert!(needs_refresh(0, 0, 60));
    }

    #[test]
    fn playlist_fuzzy_match_picks_closest_name() {
        let playlists = vec![
            Playlist {
                name: "Morning Coffee".into(),
                uri: "svc:playlist:1".into(),
            },
            Playlist {
                name: "Late Night Drive".into(),
                uri: "svc:playlist:2".into(),
            },
        ];
        let best = best_playlist("morning coffee", &playlists).unwrap();
        assert_eq!(best.uri, "svc:playlist:1");
        assert!(best_playlist("xyzzy", &playlists).is_none());
    }

    #[tokio::test]
    async fn unauthenticated_calls_short_circuit() {
        let (ctx, _dir) = testing::context();
        let module = PlayerModule::new(ctx);
        module.setup().await;

        let err = module
            .invoke("play", json!({"string_query": "wildfire"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::NotAuthenticated(_)));
    }

    #[tokio::test]
    async fn ready_message_signals_the_activation_gate() {
        let (ctx, _dir) = testing::context();
        let module = PlayerModule::new(ctx);
        assert!(!module.gate.is_ready());
        module
            .on_transport_message(json!({"message": "PLAYER_READY"}))
            .await;
        assert!(module.gate.is_ready());

        module.gate.reset();
        module
            .on_transport_message(json!({"message": "SOMETHING_ELSE"}))
            .await;
        assert!(!module.gate.is_ready());
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("hello world"), "hello+world");
        assert_eq!(urlencode("a&b=c"), "a%26b%3Dc");
        assert_eq!(urlencode("safe-chars_1.0~"), "safe-chars_1.0~");
    }
}
