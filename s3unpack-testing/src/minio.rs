//! Runs ephemeral `minio` servers to test against S3-compatible object storage without an AWS
//! account.
use crate::Result;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use bytes::Bytes;
use color_eyre::eyre::eyre;
use duct::Handle;
use once_cell::sync::Lazy;
use rand::prelude::*;
use regex::Regex;
use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;
use which::which;

const ACCESS_KEY: &str = "minioadmin";
const SECRET_KEY: &str = "minioadmin";
const REGION: &str = "us-east-1";

pub struct MinioServer {
    #[allow(dead_code)] // Deleted on drop
    data_dir: TempDir,
    handle: Handle,
    endpoint: SocketAddr,
}

impl MinioServer {
    /// Get the server shared by all tests currently running, starting one if there isn't one.
    ///
    /// The server stops once the last test holding it drops its reference.
    pub async fn get() -> Result<Arc<Self>> {
        static INSTANCE: Lazy<Mutex<Weak<MinioServer>>> = Lazy::new(|| Mutex::new(Weak::new()));

        let mut instance = INSTANCE.lock().await;

        let server = match instance.upgrade() {
            Some(server) => server,
            None => {
                let server = Arc::new(Self::start().await?);
                *instance = Arc::downgrade(&server);
                server
            }
        };

        debug!(endpoint = %server.endpoint, "Using minio server");

        server.wait_for_service_start().await?;

        Ok(server)
    }

    /// Start a new minio server listening on a free port on localhost.
    ///
    /// The `minio` binary is taken from the `MINIO_PATH` env var if set, otherwise from the
    /// `PATH`.
    pub async fn start() -> Result<Self> {
        let path = Self::find_minio()?;
        let endpoint = Self::free_endpoint()?;
        let data_dir = Self::data_dir()?;

        let handle = duct::cmd!(
            path,
            "server",
            data_dir.path(),
            "--address",
            endpoint.to_string(),
            "--quiet"
        )
        .start()?;

        let server = Self {
            data_dir,
            handle,
            endpoint,
        };

        debug!(endpoint = %server.endpoint, "Waiting for minio to start");
        server.wait_for_service_start().await?;
        debug!(endpoint = %server.endpoint, "Minio started");

        Ok(server)
    }

    /// The S3 API endpoint of this server
    pub fn endpoint_url(&self) -> Url {
        Url::parse(&format!("http://{}/", self.endpoint))
            .expect("BUG: socket address is always a valid URL host")
    }

    /// Library config that talks to this server
    pub fn config(&self) -> s3unpack::Config {
        s3unpack::Config {
            s3_endpoint: Some(self.endpoint_url()),
            aws_region: Some(REGION.to_string()),
            aws_access_key_id: Some(ACCESS_KEY.to_string()),
            aws_secret_access_key: Some(SECRET_KEY.to_string()),
            ..Default::default()
        }
    }

    /// An S3 client for inspecting this server directly
    pub async fn aws_client(&self) -> Result<aws_sdk_s3::Client> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(REGION))
            .credentials_provider(Credentials::from_keys(ACCESS_KEY, SECRET_KEY, None))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .endpoint_url(self.endpoint_url().to_string())
            .force_path_style(true)
            .build();

        Ok(aws_sdk_s3::Client::from_conf(s3_config))
    }

    /// Create a bucket with a unique name derived from `name`, and return the actual name.
    ///
    /// Tests share a server, so bucket names get a random prefix to keep them apart.
    pub async fn create_bucket(&self, name: impl AsRef<str>) -> Result<String> {
        // Bucket names may only contain letters, digits, '.' and '-', and are at most 63 chars
        static INVALID: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"[^0-9a-zA-Z\.\-]+").expect("BUG: regex is valid"));

        let name = INVALID.replace_all(name.as_ref(), "-").to_lowercase();
        let name = &name[..name.len().min(63 - 9)];
        let bucket = format!("{:08x}-{name}", rand::thread_rng().next_u32());

        debug!(%bucket, "Creating bucket");

        let client = self.aws_client().await?;
        client.create_bucket().bucket(&bucket).send().await?;

        // The bucket isn't always usable the moment creation returns
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1));

        if let Err(e) = policy
            .retry(|| client.head_bucket().bucket(&bucket).send())
            .await
        {
            return Err(eyre!(
                "Bucket {bucket} still isn't accessible after it was created.  Last error:\n{e}"
            ));
        }

        Ok(bucket)
    }

    /// Read back the complete contents of an object
    pub async fn get_object_bytes(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let client = self.aws_client().await?;
        let response = client.get_object().bucket(bucket).key(key).send().await?;
        let data = response.body.collect().await?;

        Ok(data.into_bytes())
    }

    /// All keys in `bucket`, sorted
    pub async fn list_keys(&self, bucket: &str) -> Result<Vec<String>> {
        let client = self.aws_client().await?;
        let mut keys = Vec::new();

        let mut pages = client
            .list_objects_v2()
            .bucket(bucket)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            keys.extend(
                page?
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
        }

        keys.sort();
        Ok(keys)
    }

    async fn wait_for_service_start(&self) -> Result<()> {
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1));

        let client = self.aws_client().await?;

        policy
            .retry(|| client.list_buckets().send())
            .await
            .map_err(|e| eyre!("Minio didn't come online in time.  Last ListBuckets error:\n{e}"))?;

        Ok(())
    }

    fn find_minio() -> Result<PathBuf> {
        std::env::var_os("MINIO_PATH")
            .map(PathBuf::from)
            .or_else(|| which("minio").ok())
            .ok_or_else(|| {
                eyre!("Unable to find `minio`; set MINIO_PATH or put the minio binary in the PATH")
            })
    }

    fn free_endpoint() -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        Ok(addr)
    }

    /// Minio refuses to keep its data on `tmpfs`, which rules out `/tmp` on many Linux systems, so
    /// the data directory goes under the home directory instead.
    fn data_dir() -> Result<TempDir> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("Unable to determine home directory"))?;

        Ok(tempfile::Builder::new()
            .prefix("s3unpack-minio-")
            .tempdir_in(home)?)
    }
}

impl Drop for MinioServer {
    fn drop(&mut self) {
        debug!(pids = ?self.handle.pids(), "Killing minio");

        if let Err(e) = self.handle.kill() {
            eprintln!("Error killing minio process: {e}");
        }
    }
}
