use super::{sdk_credentials, sdk_error, AwsSettings, ClientCache};
use crate::credentials::CredentialManager;
use crate::error::Result;
use crate::storage::{ObjectStore, UploadRequest};
use crate::types::Credentials;
use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ObjectCannedAcl, StorageClass};
use aws_sdk_s3::Client;
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct S3ObjectStore {
    bucket: String,
    credentials: Arc<CredentialManager>,
    settings: AwsSettings,
    clients: ClientCache<Client>,
}

impl S3ObjectStore {
    pub fn new(bucket: impl Into<String>, credentials: Arc<CredentialManager>, settings: AwsSettings) -> Self {
        Self {
            bucket: bucket.into(),
            credentials,
            settings,
            clients: ClientCache::new(),
        }
    }

    fn client(&self) -> Client {
        let snapshot = self.credentials.current();
        self.clients.get(&snapshot, |creds| build_client(creds, &self.settings))
    }
}

fn build_client(credentials: &Credentials, settings: &AwsSettings) -> Client {
    let mut builder = aws_sdk_s3::Config::builder()
        .credentials_provider(sdk_credentials(credentials))
        .region(Region::new(settings.region.clone()))
        .force_path_style(settings.endpoint.is_some());
    if let Some(endpoint) = &settings.endpoint {
        builder = builder.endpoint_url(endpoint);
    }
    debug!(region = %settings.region, "Building S3 client");
    Client::from_conf(builder.build())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, request), fields(bucket = %self.bucket, key = %request.key, bytes = request.body.len()))]
    async fn put_object(&self, request: UploadRequest) -> Result<()> {
        self.client()
            .put_object()
            .bucket(&self.bucket)
            .key(&request.key)
            .body(ByteStream::from(request.body))
            .acl(ObjectCannedAcl::Private)
            .storage_class(StorageClass::Standard)
            .set_metadata(Some(request.metadata))
            .send()
            .await
            .map_err(|e| sdk_error("put_object", e))?;
        debug!("Object written");
        Ok(())
    }
}
