use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::process::run_command_capture;
use crate::target::ObjectStorageTarget;
use crate::upload::{ObjectStore, ObjectStoreFactory};

/// Object store backed by the `aws` CLI (`s3api put-object`).
#[derive(Debug, Clone)]
pub struct AwsCliObjectStore {
    aws_bin: PathBuf,
    region: Option<String>,
    endpoint_url: Option<String>,
    profile: Option<String>,
}

impl AwsCliObjectStore {
    pub fn new(aws_bin: impl Into<PathBuf>, target: &ObjectStorageTarget) -> Self {
        Self {
            aws_bin: aws_bin.into(),
            region: target.region.clone(),
            endpoint_url: target.endpoint_url.clone(),
            profile: target.profile.clone(),
        }
    }

    fn put_object_args(&self, bucket: &str, key: &str, body: &Path, sha256: &str) -> Vec<OsString> {
        let mut args = Vec::<OsString>::new();
        for (flag, value) in [
            ("--profile", self.profile.as_deref()),
            ("--region", self.region.as_deref()),
            ("--endpoint-url", self.endpoint_url.as_deref()),
        ] {
            if let Some(v) = value.map(str::trim).filter(|s| !s.is_empty()) {
                args.push(flag.into());
                args.push(v.into());
            }
        }
        args.extend(
            [
                "s3api",
                "put-object",
                "--bucket",
                bucket,
                "--key",
                key,
                "--body",
            ]
            .map(OsString::from),
        );
        args.push(body.as_os_str().to_os_string());
        args.push("--metadata".into());
        args.push(format!("sha256={sha256}").into());
        args
    }
}

impl ObjectStore for AwsCliObjectStore {
    fn put_object(&self, bucket: &str, key: &str, body: &[u8], sha256: &str) -> Result<()> {
        // The CLI reads the payload from disk; write a fresh copy per attempt.
        let mut staged = tempfile::Builder::new()
            .prefix("consul-snapshot-")
            .suffix(".snap")
            .tempfile()
            .map_err(|e| Error::msg(format!("failed to stage snapshot for upload: {e}")))?;
        staged
            .write_all(body)
            .and_then(|_| staged.flush())
            .map_err(|e| Error::msg(format!("failed to stage snapshot for upload: {e}")))?;

        let mut cmd = Command::new(&self.aws_bin);
        cmd.args(self.put_object_args(bucket, key, staged.path(), sha256))
            .env("AWS_PAGER", "");
        run_command_capture(cmd)
            .map_err(|e| Error::msg(format!("put-object s3://{bucket}/{key} failed: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct AwsCliFactory {
    pub aws_bin: PathBuf,
}

impl Default for AwsCliFactory {
    fn default() -> Self {
        Self {
            aws_bin: PathBuf::from("aws"),
        }
    }
}

impl ObjectStoreFactory for AwsCliFactory {
    fn object_store(&self, target: &ObjectStorageTarget) -> Result<Box<dyn ObjectStore>> {
        Ok(Box::new(AwsCliObjectStore::new(&self.aws_bin, target)))
    }
}
