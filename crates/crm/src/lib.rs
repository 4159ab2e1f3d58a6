//! Mautic REST client.

mod parse;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

use freem_core::config::MauticSettings;
use freem_core::crm::{ContactRecord, CrmClient, CrmError, FieldDescriptor};

pub struct MauticClient {
    client: reqwest::Client,
    api_base: String,
    username: String,
    password: String,
}

impl MauticClient {
    pub fn new(settings: &MauticSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_base: format!("{}/api", settings.base_url.trim_end_matches('/')),
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.api_base))
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Sends the request and returns the raw body. `Ok(None)` on 404.
    async fn send_text(&self, request: RequestBuilder) -> Result<Option<String>, CrmError> {
        let resp = request
            .send()
            .await
            .map_err(|e| CrmError::Transport(e.to_string()))?;
        let status = resp.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CrmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        resp.text()
            .await
            .map(Some)
            .map_err(|e| CrmError::Transport(e.to_string()))
    }

    /// Like [`Self::send_text`], decoding the body as JSON.
    async fn send(&self, request: RequestBuilder) -> Result<Option<Value>, CrmError> {
        let Some(text) = self.send_text(request).await? else {
            return Ok(None);
        };
        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| CrmError::Unexpected(format!("invalid JSON body: {e}")))
    }

    async fn send_found(&self, request: RequestBuilder, what: &str) -> Result<Value, CrmError> {
        self.send(request)
            .await?
            .ok_or_else(|| CrmError::Status {
                status: 404,
                body: format!("{what} not found"),
            })
    }

    async fn write_contact(
        &self,
        method: Method,
        path: &str,
        fields: &Map<String, Value>,
    ) -> Result<Option<u64>, CrmError> {
        let body = self
            .send_found(self.request(method, path).json(fields), "contact")
            .await?;
        let id = parse::contact_id(&body);
        if id.is_none() {
            warn!(response = %body, "crm response did not contain a contact id");
        }
        Ok(id)
    }
}

#[async_trait]
impl CrmClient for MauticClient {
    async fn find_list(
        &self,
        query: &str,
        start: u32,
        limit: u32,
    ) -> Result<Vec<ContactRecord>, CrmError> {
        let request = self.request(Method::GET, "/contacts").query(&[
            ("search", query.to_string()),
            ("start", start.to_string()),
            ("limit", limit.to_string()),
            ("minimal", "false".to_string()),
        ]);
        let contacts = match self.send_text(request).await? {
            Some(text) => match serde_json::from_str::<Value>(&text) {
                Ok(body) => parse::contact_list(&body),
                Err(err) => {
                    warn!(query, error = %err, "undecodable contact search response, treating as empty");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        debug!(query, found = contacts.len(), "contact search");
        Ok(contacts)
    }

    async fn get(&self, id: u64) -> Result<Option<ContactRecord>, CrmError> {
        let Some(body) = self
            .send(self.request(Method::GET, &format!("/contacts/{id}")))
            .await?
        else {
            return Ok(None);
        };
        match body.get("contact").and_then(parse::contact) {
            Some(contact) => Ok(Some(contact)),
            None => Err(CrmError::Unexpected(format!(
                "contact {id} response has no contact object"
            ))),
        }
    }

    async fn create(&self, fields: &Map<String, Value>) -> Result<Option<u64>, CrmError> {
        self.write_contact(Method::POST, "/contacts/new", fields)
            .await
    }

    async fn edit(&self, id: u64, fields: &Map<String, Value>) -> Result<Option<u64>, CrmError> {
        self.write_contact(Method::PATCH, &format!("/contacts/{id}/edit"), fields)
            .await
    }

    async fn add_to_segment(&self, segment_id: u64, contact_id: u64) -> Result<(), CrmError> {
        let path = format!("/segments/{segment_id}/contact/{contact_id}/add");
        self.send_found(self.request(Method::POST, &path), "segment")
            .await?;
        Ok(())
    }

    async fn field_list(&self) -> Result<Vec<FieldDescriptor>, CrmError> {
        let request = self
            .request(Method::GET, "/fields/contact")
            .query(&[("limit", "1000")]);
        let body = self.send_found(request, "field list").await?;
        Ok(parse::field_list(&body))
    }
}
