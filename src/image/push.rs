//! Push a local image to a container service and register it
//!
//! The sequence is login, tag, push, register. Steps run one at a time and
//! the first failure ends the attempt. Once the temporary tag exists it is
//! always removed again, on a best-effort basis, whatever happens later.

use crate::engine::ImageEngine;
use crate::image::oci::Platform;
use crate::image::registry::{RegistryCredential, RemoteImage};
use crate::image::status::{digest_from_aux, display_statuses, scan_statuses, StatusError};
use crate::image::tag::UniqueTagGenerator;
use crate::service::{ImageRegistrar, RegistryLoginCreator};
use crate::{LightsailctlError, Result};
use std::future::Future;
use std::io::Write;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Time allowed for removing the temporary tag, independent of any deadline
pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(10);

/// A validated request to push and register one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    service: String,
    image: String,
    label: String,
}

impl PushRequest {
    /// Create a request; all fields are mandatory
    pub fn new(
        service: impl Into<String>,
        image: impl Into<String>,
        label: impl Into<String>,
    ) -> Result<Self> {
        let request = Self {
            service: service.into(),
            image: image.into(),
            label: label.into(),
        };

        for (what, value) in [
            ("service name", &request.service),
            ("container image", &request.image),
            ("container label", &request.label),
        ] {
            if value.is_empty() {
                return Err(LightsailctlError::InvalidInput(format!(
                    "push container image: {} is not specified",
                    what
                )));
            }
        }

        Ok(request)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Local image reference, e.g. "nginx:latest"
    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Outcome of a successful push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    pub digest: String,
    /// Name to use for the image in deployments
    pub image: String,
}

/// Drives one push attempt against the service and the local engine
pub struct ImagePusher<'a, S, E> {
    service: &'a S,
    engine: &'a E,
    tags: UniqueTagGenerator,
    platform: Platform,
    deadline: Option<Instant>,
    cleanup_grace: Duration,
}

impl<'a, S, E> ImagePusher<'a, S, E>
where
    S: RegistryLoginCreator + ImageRegistrar,
    E: ImageEngine,
{
    pub fn new(service: &'a S, engine: &'a E) -> Self {
        Self {
            service,
            engine,
            tags: UniqueTagGenerator::default(),
            platform: Platform::linux_amd64(),
            deadline: None,
            cleanup_grace: DEFAULT_CLEANUP_GRACE,
        }
    }

    pub fn with_tag_generator(mut self, tags: UniqueTagGenerator) -> Self {
        self.tags = tags;
        self
    }

    /// Bound every remote call of the attempt, except the tag cleanup
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cleanup_grace(mut self, grace: Duration) -> Self {
        self.cleanup_grace = grace;
        self
    }

    /// Push `request`'s image and register it with the service.
    ///
    /// Push progress is rendered to `progress`; the confirmation block
    /// is written to `out`.
    pub async fn push<P, O>(
        &self,
        request: &PushRequest,
        progress: &mut P,
        out: &mut O,
    ) -> Result<PushResult>
    where
        P: Write + ?Sized,
        O: Write + ?Sized,
    {
        let credential = self.bounded(self.staging_credential()).await?;
        let remote = RemoteImage::new(credential, self.tags.generate()?);
        let reference = remote.reference();

        self.bounded(async {
            self.engine
                .tag_image(request.image(), &reference)
                .await
                .map_err(LightsailctlError::Tag)
        })
        .await?;

        let outcome = self
            .bounded(self.push_and_register(request, &remote, progress, out))
            .await;

        self.try_untag(&reference).await;

        outcome
    }

    async fn staging_credential(&self) -> Result<RegistryCredential> {
        let login = self
            .service
            .create_registry_login()
            .await
            .map_err(LightsailctlError::Authentication)?;
        Ok(RegistryCredential::for_staging(login))
    }

    async fn push_and_register<P, O>(
        &self,
        request: &PushRequest,
        remote: &RemoteImage,
        progress: &mut P,
        out: &mut O,
    ) -> Result<PushResult>
    where
        P: Write + ?Sized,
        O: Write + ?Sized,
    {
        let digest = self.push_remote(remote, progress).await?;

        info!("Registering {} with service {}", digest, request.service());
        let registered = self
            .service
            .register_container_image(request.service(), request.label(), &digest)
            .await
            .map_err(LightsailctlError::Registration)?;

        writeln!(out, "Digest: {}", registered.digest)?;
        writeln!(out, "Image {:?} registered.", request.image())?;
        writeln!(out, "Refer to this image as {:?} in deployments.", registered.image)?;
        out.flush()?;

        Ok(PushResult {
            digest: registered.digest,
            image: registered.image,
        })
    }

    /// Push the tagged image and return the digest the engine reported
    async fn push_remote<P>(&self, remote: &RemoteImage, progress: &mut P) -> Result<String>
    where
        P: Write + ?Sized,
    {
        let stream = self
            .engine
            .push_image(remote, &self.platform)
            .await
            .map_err(|e| self.push_failure(e))?;

        // Lines naming the staging address or the generated tag are noise
        let mut statuses = scan_statuses(
            stream,
            vec![remote.credential.server_address.clone(), remote.tag.clone()],
        );

        let mut aux_digest = None;
        display_statuses(&mut statuses, progress, |aux| {
            if aux_digest.is_none() {
                aux_digest = digest_from_aux(aux);
            }
        })
        .await
        .map_err(|e| match e {
            StatusError::Remote(detail) => self.push_failure(detail.into()),
            StatusError::Io(e) => LightsailctlError::Io(e),
        })?;

        match statuses.digest() {
            // Newer engines
            Some(digest) => Ok(digest.to_string()),
            // Older engines
            None => aux_digest.ok_or(LightsailctlError::MissingDigest),
        }
    }

    fn push_failure(&self, cause: anyhow::Error) -> LightsailctlError {
        if self.platform.is_mismatch_message(&format!("{:#}", cause)) {
            LightsailctlError::PlatformMismatch {
                platform: self.platform.clone(),
                cause,
            }
        } else {
            LightsailctlError::Push(cause)
        }
    }

    /// Remove the temporary tag; failures are logged, never returned
    async fn try_untag(&self, reference: &str) {
        match tokio::time::timeout(self.cleanup_grace, self.engine.untag_image(reference)).await {
            Ok(Ok(())) => debug!("Removed temporary tag {}", reference),
            Ok(Err(cause)) => warn!(
                "{}",
                LightsailctlError::Untag {
                    reference: reference.to_string(),
                    cause,
                }
            ),
            Err(_) => warn!(
                "untag {:?}: gave up after {:?}",
                reference, self.cleanup_grace
            ),
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, call)
                .await
                .map_err(|_| LightsailctlError::DeadlineExceeded)?,
            None => call.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StatusStream;
    use crate::image::registry::RegistryLogin;
    use crate::image::tag::fakes::{FixedClock, FixedEntropy};
    use crate::service::RegisteredImage;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::Mutex;

    const PUSHED_DIGEST: &str =
        "sha256:10b8cc432d56da8b61b070f4c7d2543a9ed17c2b23010b43af434fd40e2ca4aa";
    const AUX_DIGEST: &str =
        "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const REMOTE_REF: &str =
        "123456789012.dkr.ecr.so-fake-2.amazonaws.com/sr:1611800397000000000-c5h66p35cpjmg";

    #[derive(Default)]
    struct FakeService {
        fail_login: bool,
        fail_register: bool,
        log: Mutex<Vec<String>>,
    }

    impl FakeService {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RegistryLoginCreator for FakeService {
        async fn create_registry_login(&self) -> anyhow::Result<RegistryLogin> {
            let op = "create login".to_string();
            if self.fail_login {
                return Err(anyhow!("failed: {}", op));
            }
            self.log.lock().unwrap().push(op);
            Ok(RegistryLogin {
                username: "gollum".to_string(),
                password: "precious".to_string(),
                registry: "123456789012.dkr.ecr.so-fake-2.amazonaws.com".to_string(),
            })
        }
    }

    #[async_trait]
    impl ImageRegistrar for FakeService {
        async fn register_container_image(
            &self,
            service: &str,
            label: &str,
            digest: &str,
        ) -> anyhow::Result<RegisteredImage> {
            let op = format!("register ({}, {}, {})", service, label, digest);
            if self.fail_register {
                return Err(anyhow!("failed: {}", op));
            }
            self.log.lock().unwrap().push(op);
            Ok(RegisteredImage {
                image: format!(":{}.{}.12345", service, label),
                digest: digest.to_string(),
            })
        }
    }

    #[derive(Default)]
    struct FakeEngine {
        fail_tag: bool,
        fail_untag: bool,
        fail_push: Option<String>,
        status_error: Option<String>,
        digest_in_aux: bool,
        digest_in_aux_and_status: bool,
        no_digest: bool,
        hang_push: bool,
        log: Mutex<Vec<String>>,
    }

    impl FakeEngine {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn status_lines(&self, remote: &RemoteImage) -> String {
            let mut lines = vec![
                format!(
                    r#"{{"status":"The push refers to repository [{}]"}}"#,
                    remote.repository()
                ),
                r#"{"status":"Waiting","progressDetail":{},"id":"d3a003bc9307"}"#.to_string(),
                r#"{"status":"Layer already exists","progressDetail":{},"id":"d3a003bc9307"}"#
                    .to_string(),
                r#"{"status":"Layer already exists","progressDetail":{},"id":"4f4fb700ef54"}"#
                    .to_string(),
            ];
            if let Some(message) = &self.status_error {
                lines.push(format!(r#"{{"errorDetail":{{"message":"{}"}}}}"#, message));
            }
            if self.digest_in_aux_and_status {
                lines.push(format!(r#"{{"aux":{{"Digest":"{}"}}}}"#, AUX_DIGEST));
            }
            if self.digest_in_aux {
                lines.push(format!(r#"{{"aux":{{"digest":"{}"}}}}"#, PUSHED_DIGEST));
            } else if !self.no_digest {
                lines.push(format!(
                    r#"{{"status":"{}: digest: {} size: 1819"}}"#,
                    remote.tag, PUSHED_DIGEST
                ));
            }
            lines.join("\n")
        }
    }

    #[async_trait]
    impl ImageEngine for FakeEngine {
        async fn tag_image(&self, source: &str, target: &str) -> anyhow::Result<()> {
            let op = format!("tag {:?} as {:?}", source, target);
            if self.fail_tag {
                return Err(anyhow!("failed: {}", op));
            }
            self.log.lock().unwrap().push(op);
            Ok(())
        }

        async fn untag_image(&self, reference: &str) -> anyhow::Result<()> {
            let op = format!("untag {:?}", reference);
            if self.fail_untag {
                return Err(anyhow!("failed: {}", op));
            }
            self.log.lock().unwrap().push(op);
            Ok(())
        }

        async fn push_image(
            &self,
            remote: &RemoteImage,
            platform: &Platform,
        ) -> anyhow::Result<StatusStream> {
            assert_eq!(platform, &Platform::linux_amd64());
            let op = format!("push {:?}", remote.reference());
            if let Some(message) = &self.fail_push {
                return Err(anyhow!("{}", message));
            }
            self.log.lock().unwrap().push(op);
            if self.hang_push {
                std::future::pending::<()>().await;
            }
            Ok(Box::pin(Cursor::new(self.status_lines(remote).into_bytes())))
        }
    }

    fn request() -> PushRequest {
        PushRequest::new("doge", "nginx:latest", "www").unwrap()
    }

    fn pusher<'a>(
        service: &'a FakeService,
        engine: &'a FakeEngine,
        secs: i64,
    ) -> ImagePusher<'a, FakeService, FakeEngine> {
        ImagePusher::new(service, engine).with_tag_generator(UniqueTagGenerator::new(
            FixedClock::from_secs(secs),
            FixedEntropy(b"abcdefgh"),
        ))
    }

    async fn run(service: &FakeService, engine: &FakeEngine) -> (Result<PushResult>, String) {
        let mut progress = Vec::new();
        let mut out = Vec::new();
        let result = pusher(service, engine, 1611800397)
            .push(&request(), &mut progress, &mut out)
            .await;
        (result, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn test_push_transcript() {
        let service = FakeService::default();
        let engine = FakeEngine::default();

        let mut progress = Vec::new();
        let mut out = Vec::new();
        let result = pusher(&service, &engine, 1611796436)
            .push(&request(), &mut progress, &mut out)
            .await
            .unwrap();

        assert_eq!(
            result,
            PushResult {
                digest: PUSHED_DIGEST.to_string(),
                image: ":doge.www.12345".to_string(),
            }
        );
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!(
                "Digest: {}\n\
                 Image \"nginx:latest\" registered.\n\
                 Refer to this image as \":doge.www.12345\" in deployments.\n",
                PUSHED_DIGEST
            )
        );
        assert_eq!(
            engine.log(),
            vec![
                r#"tag "nginx:latest" as "123456789012.dkr.ecr.so-fake-2.amazonaws.com/sr:1611796436000000000-c5h66p35cpjmg""#,
                r#"push "123456789012.dkr.ecr.so-fake-2.amazonaws.com/sr:1611796436000000000-c5h66p35cpjmg""#,
                r#"untag "123456789012.dkr.ecr.so-fake-2.amazonaws.com/sr:1611796436000000000-c5h66p35cpjmg""#,
            ]
        );
        assert_eq!(
            service.log(),
            vec![
                "create login".to_string(),
                format!("register (doge, www, {})", PUSHED_DIGEST),
            ]
        );

        // Address and tag lines are filtered out of the progress output
        assert_eq!(
            String::from_utf8(progress).unwrap(),
            "d3a003bc9307: Waiting\n\
             d3a003bc9307: Layer already exists\n\
             4f4fb700ef54: Layer already exists\n"
        );
    }

    #[tokio::test]
    async fn test_login_failure() {
        let service = FakeService {
            fail_login: true,
            ..Default::default()
        };
        let engine = FakeEngine::default();

        let (result, out) = run(&service, &engine).await;
        let err = result.unwrap_err();

        assert!(matches!(err, LightsailctlError::Authentication(_)));
        assert_eq!(err.to_string(), "failed: create login");
        assert!(engine.log().is_empty());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_tag_failure_skips_everything_else() {
        let service = FakeService::default();
        let engine = FakeEngine {
            fail_tag: true,
            ..Default::default()
        };

        let (result, _) = run(&service, &engine).await;
        let err = result.unwrap_err();

        assert!(matches!(err, LightsailctlError::Tag(_)));
        assert_eq!(
            err.to_string(),
            format!(r#"failed: tag "nginx:latest" as "{}""#, REMOTE_REF)
        );
        assert!(engine.log().is_empty());
        assert_eq!(service.log(), vec!["create login".to_string()]);
    }

    #[tokio::test]
    async fn test_push_failure_still_untags() {
        let service = FakeService::default();
        let engine = FakeEngine {
            fail_push: Some(format!("failed: push {:?}", REMOTE_REF)),
            ..Default::default()
        };

        let (result, _) = run(&service, &engine).await;
        let err = result.unwrap_err();

        assert!(matches!(err, LightsailctlError::Push(_)));
        assert_eq!(err.to_string(), format!(r#"failed: push "{}""#, REMOTE_REF));
        assert_eq!(
            engine.log(),
            vec![
                format!(r#"tag "nginx:latest" as "{}""#, REMOTE_REF),
                format!(r#"untag "{}""#, REMOTE_REF),
            ]
        );
        assert_eq!(service.log(), vec!["create login".to_string()]);
    }

    #[tokio::test]
    async fn test_register_failure_still_untags() {
        let service = FakeService {
            fail_register: true,
            ..Default::default()
        };
        let engine = FakeEngine::default();

        let (result, out) = run(&service, &engine).await;
        let err = result.unwrap_err();

        assert!(matches!(err, LightsailctlError::Registration(_)));
        assert_eq!(
            err.to_string(),
            format!("failed: register (doge, www, {})", PUSHED_DIGEST)
        );
        assert_eq!(engine.log().last().unwrap(), &format!(r#"untag "{}""#, REMOTE_REF));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_untag_failure_is_ignored() {
        let service = FakeService::default();
        let engine = FakeEngine {
            fail_untag: true,
            ..Default::default()
        };

        let (result, out) = run(&service, &engine).await;

        assert_eq!(result.unwrap().digest, PUSHED_DIGEST);
        assert!(out.starts_with("Digest: "));
    }

    #[tokio::test]
    async fn test_untag_failure_keeps_push_error() {
        let service = FakeService {
            fail_register: true,
            ..Default::default()
        };
        let engine = FakeEngine {
            fail_untag: true,
            ..Default::default()
        };

        let (result, _) = run(&service, &engine).await;
        assert!(matches!(
            result.unwrap_err(),
            LightsailctlError::Registration(_)
        ));
    }

    #[tokio::test]
    async fn test_platform_mismatch_from_push_call() {
        let service = FakeService::default();
        let engine = FakeEngine {
            fail_push: Some(
                "... does not match the specified platform (linux/amd64)".to_string(),
            ),
            ..Default::default()
        };

        let (result, _) = run(&service, &engine).await;
        let err = result.unwrap_err();

        match &err {
            LightsailctlError::PlatformMismatch { platform, .. } => {
                assert_eq!(platform, &Platform::linux_amd64())
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(err.to_string(), "image does not provide linux/amd64 platform");
        assert_eq!(engine.log().last().unwrap(), &format!(r#"untag "{}""#, REMOTE_REF));
    }

    #[tokio::test]
    async fn test_platform_mismatch_from_status_stream() {
        let service = FakeService::default();
        let engine = FakeEngine {
            status_error: Some(
                "... does not provide the specified platform (linux/amd64)".to_string(),
            ),
            ..Default::default()
        };

        let (result, _) = run(&service, &engine).await;
        let err = result.unwrap_err();

        assert!(matches!(err, LightsailctlError::PlatformMismatch { .. }));
        assert_eq!(err.to_string(), "image does not provide linux/amd64 platform");
        assert_eq!(service.log(), vec!["create login".to_string()]);
    }

    #[tokio::test]
    async fn test_other_stream_error_is_push_error() {
        let service = FakeService::default();
        let engine = FakeEngine {
            status_error: Some("denied: not authorized".to_string()),
            ..Default::default()
        };

        let (result, _) = run(&service, &engine).await;
        let err = result.unwrap_err();

        assert!(matches!(err, LightsailctlError::Push(_)));
        assert_eq!(err.to_string(), "denied: not authorized");
    }

    #[tokio::test]
    async fn test_digest_from_aux() {
        let service = FakeService::default();
        let engine = FakeEngine {
            digest_in_aux: true,
            ..Default::default()
        };

        let (result, _) = run(&service, &engine).await;
        assert_eq!(result.unwrap().digest, PUSHED_DIGEST);
    }

    #[tokio::test]
    async fn test_status_digest_beats_aux_digest() {
        let service = FakeService::default();
        let engine = FakeEngine {
            digest_in_aux_and_status: true,
            ..Default::default()
        };

        let (result, _) = run(&service, &engine).await;
        assert_eq!(result.unwrap().digest, PUSHED_DIGEST);
        assert_eq!(
            service.log().last().unwrap(),
            &format!("register (doge, www, {})", PUSHED_DIGEST)
        );
    }

    #[tokio::test]
    async fn test_missing_digest() {
        let service = FakeService::default();
        let engine = FakeEngine {
            no_digest: true,
            ..Default::default()
        };

        let (result, _) = run(&service, &engine).await;
        let err = result.unwrap_err();

        assert!(matches!(err, LightsailctlError::MissingDigest));
        assert_eq!(
            err.to_string(),
            "image push response does not contain the image digest"
        );
        assert_eq!(service.log(), vec!["create login".to_string()]);
        assert_eq!(engine.log().last().unwrap(), &format!(r#"untag "{}""#, REMOTE_REF));
    }

    #[tokio::test]
    async fn test_deadline_still_untags() {
        let service = FakeService::default();
        let engine = FakeEngine {
            hang_push: true,
            ..Default::default()
        };

        let mut progress = Vec::new();
        let mut out = Vec::new();
        let result = pusher(&service, &engine, 1611800397)
            .with_deadline(Instant::now() + Duration::from_millis(50))
            .push(&request(), &mut progress, &mut out)
            .await;

        assert!(matches!(
            result.unwrap_err(),
            LightsailctlError::DeadlineExceeded
        ));
        assert_eq!(engine.log().last().unwrap(), &format!(r#"untag "{}""#, REMOTE_REF));
    }

    #[tokio::test]
    async fn test_each_attempt_uses_a_new_tag() {
        let service = FakeService::default();
        let engine = FakeEngine::default();
        let pusher = ImagePusher::new(&service, &engine);

        let mut progress = Vec::new();
        let mut out = Vec::new();
        pusher.push(&request(), &mut progress, &mut out).await.unwrap();
        pusher.push(&request(), &mut progress, &mut out).await.unwrap();

        let tags: Vec<String> = engine
            .log()
            .into_iter()
            .filter(|op| op.starts_with("tag "))
            .collect();
        assert_eq!(tags.len(), 2);
        assert_ne!(tags[0], tags[1]);
    }

    #[test]
    fn test_request_validation() {
        for (service, image, label, missing) in [
            ("dyservicev3", "hello:latest", "", "container label"),
            ("dyservicev3", "", "david16", "container image"),
            ("", "hello:latest", "david16", "service name"),
        ] {
            let err = PushRequest::new(service, image, label).unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("push container image: {} is not specified", missing)
            );
        }

        let request = PushRequest::new("dyservicev3", "hello:latest", "david16").unwrap();
        assert_eq!(request.service(), "dyservicev3");
        assert_eq!(request.image(), "hello:latest");
        assert_eq!(request.label(), "david16");
    }
}
