use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fragment_ingest::{FragmentFetcher, LocalClip, Recording, RecordingSource};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::models::{
    ApiResponse, AuthData, CameraList, RecordingList, fallback_camera_name,
};
use crate::config::SurveillanceConfig;
use crate::retry::{RetryConfig, with_retry};
use crate::{Error, Result};

const AUTH_API: &str = "SYNO.API.Auth";
const CAMERA_API: &str = "SYNO.SurveillanceStation.Camera";
const RECORDING_API: &str = "SYNO.SurveillanceStation.Recording";

const AUTH_VERSION: &str = "7";
const CAMERA_VERSION: &str = "9";
const RECORDING_VERSION: &str = "6";

/// A session is renewed after this long even if the server still accepts it.
const SESSION_TTL: Duration = Duration::from_secs(600);

const LOGIN_TIMEOUT: Duration = Duration::from_secs(15);
const LIST_TIMEOUT: Duration = Duration::from_secs(20);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Session {
    sid: String,
    created_at: Instant,
}

impl Session {
    fn is_fresh(&self) -> bool {
        self.created_at.elapsed() < SESSION_TTL
    }
}

/// Client for the Surveillance Station Web API.
///
/// Logs in lazily, reuses the session for [`SESSION_TTL`] and logs in again
/// when the server reports the session as expired.
pub struct SurveillanceClient {
    http: reqwest::Client,
    config: SurveillanceConfig,
    endpoint: String,
    retry: RetryConfig,
    session: Mutex<Option<Session>>,
    cameras: RwLock<HashMap<String, String>>,
}

impl SurveillanceClient {
    pub fn new(http: reqwest::Client, config: SurveillanceConfig) -> Self {
        let endpoint = format!("{}/webapi/entry.cgi", config.base_url.trim_end_matches('/'));
        Self {
            http,
            config,
            endpoint,
            retry: RetryConfig::default(),
            session: Mutex::new(None),
            cameras: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[cfg(test)]
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn login(&self) -> Result<Session> {
        let mut params = vec![
            ("api", AUTH_API.to_string()),
            ("version", AUTH_VERSION.to_string()),
            ("method", "login".to_string()),
            ("account", self.config.username.clone()),
            ("passwd", self.config.password.clone()),
            ("session", "SurveillanceStation".to_string()),
            ("format", "cookie".to_string()),
        ];
        if let Some(otp) = &self.config.otp_code {
            params.push(("otp_code", otp.clone()));
        }

        let response: ApiResponse<AuthData> = self
            .http
            .get(&self.endpoint)
            .query(&params)
            .timeout(LOGIN_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response.data {
            Some(auth) if response.success => {
                info!("Authenticated with Surveillance Station");
                Ok(Session {
                    sid: auth.sid,
                    created_at: Instant::now(),
                })
            }
            _ => Err(Error::Auth(format!(
                "login rejected with code {}",
                response.error_code()
            ))),
        }
    }

    /// Current session id, logging in when there is none or it has aged out.
    async fn sid(&self) -> Result<String> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref().filter(|s| s.is_fresh()) {
            return Ok(current.sid.clone());
        }
        let fresh = self.login().await?;
        let sid = fresh.sid.clone();
        *session = Some(fresh);
        Ok(sid)
    }

    async fn invalidate_session(&self) {
        *self.session.lock().await = None;
    }

    /// Authenticated JSON call. Session errors drop the cached session so the
    /// next attempt logs in again.
    async fn call<T>(
        &self,
        api: &'static str,
        version: &'static str,
        method: &'static str,
        params: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let sid = self.sid().await?;
        let response: ApiResponse<T> = self
            .http
            .get(&self.endpoint)
            .query(&[("api", api), ("version", version), ("method", method)])
            .query(&[("_sid", sid.as_str())])
            .query(params)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.success {
            let err = Error::Api {
                api,
                code: response.error_code(),
            };
            if err.is_session_error() {
                debug!(api, "Session rejected, will log in again");
                self.invalidate_session().await;
            }
            return Err(err);
        }
        Ok(response.data.unwrap_or_default())
    }

    /// Reload the camera name cache. Returns the number of cameras.
    pub async fn refresh_cameras(&self) -> Result<usize> {
        let list: CameraList = with_retry(&self.retry, "camera list", || {
            self.call(CAMERA_API, CAMERA_VERSION, "List", &[], LIST_TIMEOUT)
        })
        .await?;

        let names: HashMap<_, _> = list
            .cameras
            .iter()
            .map(|cam| (cam.id_string(), cam.display_name()))
            .collect();
        let count = names.len();
        *self.cameras.write() = names;
        info!(cameras = count, "Loaded camera list");
        Ok(count)
    }

    /// Display name of a camera, loading the camera list on first use.
    pub async fn camera_name(&self, camera_id: &str) -> String {
        let cache_empty = self.cameras.read().is_empty();
        if cache_empty && let Err(e) = self.refresh_cameras().await {
            warn!(error = %e, "Failed to load camera list");
        }
        self.cameras
            .read()
            .get(camera_id)
            .cloned()
            .unwrap_or_else(|| fallback_camera_name(camera_id))
    }

    async fn list_once(
        &self,
        channel_id: &str,
        from_time: i64,
        to_time: i64,
        limit: usize,
    ) -> Result<Vec<Recording>> {
        let params = [
            ("offset", "0".to_string()),
            ("limit", limit.to_string()),
            ("fromTime", from_time.to_string()),
            ("toTime", to_time.to_string()),
            ("blIncludeThumb", "true".to_string()),
            ("cameraIds", channel_id.to_string()),
        ];
        let list: RecordingList = self
            .call(RECORDING_API, RECORDING_VERSION, "List", &params, LIST_TIMEOUT)
            .await?;

        let now = chrono::Utc::now().timestamp();
        let total = list.recordings.len();
        let recordings: Vec<_> = list
            .recordings
            .into_iter()
            .filter_map(|r| r.into_recording(now))
            .collect();
        if recordings.len() < total {
            warn!(
                skipped = total - recordings.len(),
                "Ignored recordings without an id"
            );
        }
        debug!(channel_id, count = recordings.len(), "Listed recordings");
        Ok(recordings)
    }

    /// Download one range into a temp file under the download dir.
    ///
    /// `Ok(None)` when the server has nothing for the range.
    async fn download_once(
        &self,
        recording_id: &str,
        offset_ms: u64,
        duration_ms: u64,
    ) -> Result<Option<LocalClip>> {
        let sid = self.sid().await?;
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("api", RECORDING_API),
                ("version", RECORDING_VERSION),
                ("method", "Download"),
                ("_sid", sid.as_str()),
                ("id", recording_id),
                ("mountId", "0"),
            ])
            .query(&[("offsetTimeMs", offset_ms), ("playTimeMs", duration_ms)])
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            debug!(recording_id, status = status.as_u16(), "Download not available");
            return Ok(None);
        }

        // Errors come back as a JSON envelope with status 200.
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        if is_json {
            let body: ApiResponse<serde_json::Value> = response.json().await?;
            let err = Error::Api {
                api: RECORDING_API,
                code: body.error_code(),
            };
            if err.is_session_error() {
                self.invalidate_session().await;
                return Err(err);
            }
            debug!(recording_id, error = %err, "Download refused");
            return Ok(None);
        }

        let dir = &self.config.download_dir;
        let temp = tempfile::Builder::new()
            .prefix(&format!("{recording_id}_frag_{offset_ms}_{duration_ms}_"))
            .suffix(".mp4")
            .tempfile_in(dir)
            .map_err(|e| Error::io_path("creating clip file in", dir, e))?;
        let std_file = temp
            .reopen()
            .map_err(|e| Error::io_path("opening clip file", temp.path(), e))?;
        let mut file = tokio::fs::File::from_std(std_file);

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io_path("writing clip file", temp.path(), e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| Error::io_path("flushing clip file", temp.path(), e))?;
        drop(file);

        if written == 0 {
            warn!(recording_id, offset_ms, "Downloaded fragment is empty");
            return Ok(None);
        }

        let path = temp
            .into_temp_path()
            .keep()
            .map_err(|e| Error::io_path("keeping clip file", &e.path, e.error))?;
        info!(
            recording_id,
            offset_ms,
            duration_ms,
            size_mb = format!("{:.1}", written as f64 / (1024.0 * 1024.0)),
            "Downloaded fragment"
        );
        Ok(Some(LocalClip::new(path, written)))
    }
}

#[async_trait]
impl RecordingSource for SurveillanceClient {
    async fn list_recordings(
        &self,
        channel_id: &str,
        from_time: i64,
        to_time: i64,
        limit: usize,
    ) -> fragment_ingest::Result<Vec<Recording>> {
        with_retry(&self.retry, "recording list", || {
            self.list_once(channel_id, from_time, to_time, limit)
        })
        .await
        .map_err(|e| fragment_ingest::Error::source_failed(e.to_string()))
    }
}

#[async_trait]
impl FragmentFetcher for SurveillanceClient {
    async fn fetch_fragment(
        &self,
        recording_id: &str,
        offset_ms: u64,
        duration_ms: u64,
    ) -> Option<LocalClip> {
        info!(
            recording_id,
            offset_s = offset_ms as f64 / 1000.0,
            duration_s = duration_ms as f64 / 1000.0,
            "Downloading fragment"
        );
        match with_retry(&self.retry, "fragment download", || {
            self.download_once(recording_id, offset_ms, duration_ms)
        })
        .await
        {
            Ok(clip) => clip,
            Err(e) => {
                warn!(recording_id, offset_ms, error = %e, "Fragment download failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::test_support::{json, serve};

    fn client(base_url: String, download_dir: &std::path::Path) -> SurveillanceClient {
        let config = SurveillanceConfig {
            base_url,
            username: "relay".into(),
            password: "secret".into(),
            otp_code: Some("123456".into()),
            accept_invalid_certs: false,
            download_dir: download_dir.to_path_buf(),
        };
        crate::utils::http_client::install_rustls_provider();
        SurveillanceClient::new(reqwest::Client::new(), config).with_retry_config(RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 1,
            use_jitter: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let c = client("https://nas.local:5001/".into(), dir.path());
        assert_eq!(c.endpoint(), "https://nas.local:5001/webapi/entry.cgi");
    }

    #[tokio::test]
    async fn test_login_is_reused_across_calls() {
        let logins = Arc::new(AtomicUsize::new(0));
        let counter = logins.clone();
        let base = serve(Arc::new(move |target: &str| {
            if target.contains("method=login") {
                assert!(target.contains("otp_code=123456"));
                assert!(target.contains("session=SurveillanceStation"));
                counter.fetch_add(1, Ordering::SeqCst);
                json(r#"{"success":true,"data":{"sid":"abc"}}"#)
            } else {
                assert!(target.contains("_sid=abc"));
                assert!(target.contains("cameraIds=5"));
                json(r#"{"success":true,"data":{"recordings":[{"id":1,"cameraId":5,"startTime":1}]}}"#)
            }
        }))
        .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let c = client(base, dir.path());

        for _ in 0..2 {
            let recordings = c.list_recordings("5", 0, 100, 30).await.unwrap();
            assert_eq!(recordings.len(), 1);
            assert_eq!(recordings[0].id, "1");
        }
        assert_eq!(logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_session_triggers_new_login() {
        let logins = Arc::new(AtomicUsize::new(0));
        let lists = Arc::new(AtomicUsize::new(0));
        let (login_counter, list_counter) = (logins.clone(), lists.clone());
        let base = serve(Arc::new(move |target: &str| {
            if target.contains("method=login") {
                let n = login_counter.fetch_add(1, Ordering::SeqCst);
                json(&format!(r#"{{"success":true,"data":{{"sid":"s{n}"}}}}"#))
            } else if list_counter.fetch_add(1, Ordering::SeqCst) == 0 {
                json(r#"{"success":false,"error":{"code":119}}"#)
            } else {
                assert!(target.contains("_sid=s1"));
                json(r#"{"success":true,"data":{"recordings":[]}}"#)
            }
        }))
        .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let c = client(base, dir.path());

        let recordings = c.list_recordings("5", 0, 100, 30).await.unwrap();
        assert!(recordings.is_empty());
        assert_eq!(logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_login_is_not_retried() {
        let logins = Arc::new(AtomicUsize::new(0));
        let counter = logins.clone();
        let base = serve(Arc::new(move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            json(r#"{"success":false,"error":{"code":400}}"#)
        }))
        .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let c = client(base, dir.path());

        assert!(c.list_recordings("5", 0, 100, 30).await.is_err());
        assert_eq!(logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_download_writes_clip() {
        let base = serve(Arc::new(|target: &str| {
            if target.contains("method=login") {
                json(r#"{"success":true,"data":{"sid":"abc"}}"#)
            } else {
                assert!(target.contains("method=Download"));
                assert!(target.contains("offsetTimeMs=10000"));
                assert!(target.contains("playTimeMs=5000"));
                (200, "video/mp4", vec![7u8; 4096])
            }
        }))
        .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let c = client(base, dir.path());

        let clip = c.fetch_fragment("42", 10_000, 5_000).await.unwrap();
        assert_eq!(clip.size_bytes(), 4096);
        assert!(clip.path().starts_with(dir.path()));
        assert!(clip.path().to_string_lossy().ends_with(".mp4"));
        assert_eq!(std::fs::read(clip.path()).unwrap().len(), 4096);
        clip.discard().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_or_missing_download_yields_none() {
        let base = serve(Arc::new(|target: &str| {
            if target.contains("method=login") {
                json(r#"{"success":true,"data":{"sid":"abc"}}"#)
            } else if target.contains("id=empty") {
                (200, "video/mp4", Vec::new())
            } else if target.contains("id=refused") {
                json(r#"{"success":false,"error":{"code":400}}"#)
            } else {
                (404, "text/plain", b"not found".to_vec())
            }
        }))
        .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let c = client(base, dir.path());

        assert!(c.fetch_fragment("empty", 0, 10_000).await.is_none());
        assert!(c.fetch_fragment("refused", 0, 10_000).await.is_none());
        assert!(c.fetch_fragment("gone", 0, 10_000).await.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_camera_names_are_cached() {
        let lists = Arc::new(AtomicUsize::new(0));
        let counter = lists.clone();
        let base = serve(Arc::new(move |target: &str| {
            if target.contains("method=login") {
                json(r#"{"success":true,"data":{"sid":"abc"}}"#)
            } else {
                counter.fetch_add(1, Ordering::SeqCst);
                json(r#"{"success":true,"data":{"cameras":[{"id":5,"newName":"Porch"}]}}"#)
            }
        }))
        .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let c = client(base, dir.path());

        assert_eq!(c.camera_name("5").await, "Porch");
        assert_eq!(c.camera_name("9").await, "Camera 9");
        assert_eq!(lists.load(Ordering::SeqCst), 1);
    }
}
