use clap::Args;

/// Connection settings for an S3-compatible bucket.
#[derive(Args, Debug, Clone, Default)]
pub struct S3Config {
    /// Bucket holding the volumes (one key prefix per volume)
    #[arg(long = "s3-bucket", env = "VOLSTORE_S3_BUCKET")]
    pub bucket: Option<String>,

    /// Endpoint URL for non-AWS stores (R2, MinIO)
    #[arg(long = "s3-endpoint", env = "VOLSTORE_S3_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Region ("auto" for R2)
    #[arg(long = "s3-region", default_value = "auto", env = "VOLSTORE_S3_REGION")]
    pub region: String,

    /// Access key ID; the default AWS credential chain is used when unset
    #[arg(long = "s3-access-key-id", env = "VOLSTORE_S3_ACCESS_KEY_ID")]
    pub access_key_id: Option<String>,

    /// Secret access key
    #[arg(
        long = "s3-secret-access-key",
        env = "VOLSTORE_S3_SECRET_ACCESS_KEY",
        hide_env_values = true
    )]
    pub secret_access_key: Option<String>,
}

impl S3Config {
    /// Cloudflare R2 endpoint for an account.
    pub fn r2_endpoint(account_id: &str) -> String {
        format!("https://{}.r2.cloudflarestorage.com", account_id)
    }

    /// Explicit credentials, when both halves are set.
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (self.access_key_id.as_deref(), self.secret_access_key.as_deref()) {
            (Some(id), Some(secret)) => Some((id, secret)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_credentials_need_both_halves() {
        let mut config = S3Config {
            access_key_id: Some("id".into()),
            ..Default::default()
        };
        assert!(config.static_credentials().is_none());

        config.secret_access_key = Some("secret".into());
        assert_eq!(config.static_credentials(), Some(("id", "secret")));
    }

    #[test]
    fn test_r2_endpoint() {
        assert_eq!(
            S3Config::r2_endpoint("abc123"),
            "https://abc123.r2.cloudflarestorage.com"
        );
    }
}
