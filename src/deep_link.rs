// Repository deep links
// recipesync://repository?provider=google_drive&folder=<id>&name=<name>

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

use crate::providers::ProviderType;

pub const DEEP_LINK_SCHEME: &str = "recipesync";
const REPOSITORY_TARGET: &str = "repository";

#[derive(Error, Debug, PartialEq)]
pub enum DeepLinkError {
    #[error("Invalid link: {0}")]
    Malformed(String),
    #[error("Unsupported link scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Unsupported link target: {0}")]
    UnsupportedTarget(String),
    #[error("Link is missing the '{0}' parameter")]
    MissingParameter(&'static str),
    #[error("Unknown provider in link: {0}")]
    UnknownProvider(String),
}

/// A repository another user shared, as carried by a deep link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryLink {
    pub provider: ProviderType,
    pub folder_id: String,
    pub name: String,
}

impl RepositoryLink {
    pub fn new(provider: ProviderType, folder_id: &str, name: &str) -> Self {
        Self {
            provider,
            folder_id: folder_id.to_string(),
            name: name.to_string(),
        }
    }

    pub fn parse(link: &str) -> Result<Self, DeepLinkError> {
        let url = Url::parse(link.trim()).map_err(|e| DeepLinkError::Malformed(e.to_string()))?;

        if url.scheme() != DEEP_LINK_SCHEME {
            return Err(DeepLinkError::UnsupportedScheme(url.scheme().to_string()));
        }
        let target = url.host_str().unwrap_or_default();
        if target != REPOSITORY_TARGET {
            return Err(DeepLinkError::UnsupportedTarget(target.to_string()));
        }

        let mut provider = None;
        let mut folder_id = None;
        let mut name = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "provider" => provider = Some(value.into_owned()),
                "folder" => folder_id = Some(value.into_owned()),
                "name" => name = Some(value.into_owned()),
                _ => {}
            }
        }

        let provider = provider
            .filter(|p| !p.is_empty())
            .ok_or(DeepLinkError::MissingParameter("provider"))?;
        let provider = ProviderType::from_str(&provider)
            .map_err(|_| DeepLinkError::UnknownProvider(provider))?;
        let folder_id = folder_id
            .filter(|f| !f.is_empty())
            .ok_or(DeepLinkError::MissingParameter("folder"))?;
        // Old links carried no name; fall back to the folder id
        let name = name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| folder_id.clone());

        Ok(Self { provider, folder_id, name })
    }

    pub fn to_link(&self) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("provider", self.provider.as_key())
            .append_pair("folder", &self.folder_id)
            .append_pair("name", &self.name)
            .finish();
        format!("{}://{}?{}", DEEP_LINK_SCHEME, REPOSITORY_TARGET, query)
    }
}

impl FromStr for RepositoryLink {
    type Err = DeepLinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RepositoryLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_link())
    }
}
