use anyhow::{Context, Result};
use hush_server::wire::{
    BurnRequest, CreateRequest, CreateResponse, ErrorBody, SecretResponse, TokenResponse,
};
use reqwest::{Client, Response, StatusCode};
use url::Url;

/// Thin HTTP client for a hush server.
pub struct HushClient {
    http: Client,
    base: Url,
}

impl HushClient {
    pub fn new(mut base: Url) -> Self {
        // `Url::join` replaces the last segment unless the path ends in '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self {
            http: Client::new(),
            base,
        }
    }

    pub fn parse(server: &str) -> Result<Self> {
        let base = Url::parse(server).with_context(|| format!("invalid server URL: {server}"))?;
        Ok(Self::new(base))
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base.join(path).context("build request URL")
    }

    pub async fn request_token(&self) -> Result<TokenResponse> {
        let resp = self
            .http
            .post(self.url("api/token")?)
            .send()
            .await
            .context("HTTP request failed")?;
        let resp = ensure_success(resp).await?;
        resp.json().await.context("parse token response")
    }

    pub async fn create(&self, token: &str, body: &CreateRequest) -> Result<CreateResponse> {
        let resp = self
            .http
            .post(self.url("api/secrets")?)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .context("HTTP request failed")?;
        let resp = ensure_success(resp).await?;
        resp.json().await.context("parse create response")
    }

    /// `None` when the server reports the secret as not available.
    pub async fn fetch(&self, id: &str) -> Result<Option<SecretResponse>> {
        let resp = self
            .http
            .get(self.url(&format!("api/secrets/{id}"))?)
            .send()
            .await
            .context("HTTP request failed")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = ensure_success(resp).await?;
        resp.json().await.map(Some).context("parse secret response")
    }

    pub async fn burn(&self, id: &str, burn_token: &str) -> Result<()> {
        let body = BurnRequest {
            burn_token: burn_token.to_owned(),
        };
        let resp = self
            .http
            .post(self.url(&format!("api/secrets/{id}/burn"))?)
            .json(&body)
            .send()
            .await
            .context("HTTP request failed")?;
        ensure_success(resp).await?;
        Ok(())
    }
}

async fn ensure_success(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(ErrorBody {
            error,
            message: Some(message),
        }) => anyhow::bail!("server returned {status}: {error}: {message}"),
        Ok(ErrorBody { error, .. }) => anyhow::bail!("server returned {status}: {error}"),
        Err(_) => anyhow::bail!("server returned {status}: {text}"),
    }
}
