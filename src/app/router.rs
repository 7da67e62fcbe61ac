//! In-app locations (`/bug/42?ids=41,42,43`, `/home/inbox`, ...) and their
//! conversion to and from the strings a location bar shows.

use url::{Position, Url};

use crate::core::models::RecordId;

const BASE: &str = "https://bugdeck.invalid/";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("malformed location {0:?}")]
    Malformed(String),
    #[error("unknown location {0:?}")]
    Unknown(String),
}

/// Query parameters carried by a bug location so a history entry can rebuild
/// the tab's sibling list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryParams {
    pub ids: Vec<RecordId>,
    pub att_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Bug { id: RecordId, params: HistoryParams },
    Attachment { id: u64 },
    Home { folder: String },
    Profile { email: String },
}

impl Route {
    pub fn bug(id: RecordId) -> Self {
        Route::Bug {
            id,
            params: HistoryParams::default(),
        }
    }

    pub fn inbox() -> Self {
        Route::home("inbox")
    }

    pub fn home(folder: &str) -> Self {
        Route::Home {
            folder: folder.to_string(),
        }
    }

    /// Parse a location such as `/bug/7?ids=6,7,8&att_id=3`.
    pub fn parse(location: &str) -> Result<Self, RouteError> {
        let base = Url::parse(BASE).map_err(|e| RouteError::Malformed(e.to_string()))?;
        let url = base
            .join(location)
            .map_err(|_| RouteError::Malformed(location.to_string()))?;
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let number = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| RouteError::Malformed(location.to_string()))
        };

        match segments.as_slice() {
            ["bug", id] => {
                let mut params = HistoryParams::default();
                for (key, value) in url.query_pairs() {
                    match key.as_ref() {
                        "ids" => {
                            params.ids = value
                                .split(',')
                                .filter(|s| !s.is_empty())
                                .map(number)
                                .collect::<Result<_, _>>()?;
                        }
                        "att_id" => params.att_id = Some(number(&*value)?),
                        other => log::debug!("Ignoring location parameter {other:?}"),
                    }
                }
                Ok(Route::Bug {
                    id: number(*id)?,
                    params,
                })
            }
            ["attachment", id] => Ok(Route::Attachment { id: number(*id)? }),
            ["home", folder] => Ok(Route::Home {
                folder: folder.to_string(),
            }),
            ["profile", email] => Ok(Route::Profile {
                email: email.to_string(),
            }),
            _ => Err(RouteError::Unknown(location.to_string())),
        }
    }

    pub fn path(&self) -> String {
        match self {
            Route::Bug { id, .. } => format!("/bug/{id}"),
            Route::Attachment { id } => format!("/attachment/{id}"),
            Route::Home { folder } => format!("/home/{folder}"),
            Route::Profile { email } => format!("/profile/{email}"),
        }
    }

    pub fn params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Route::Bug { params: p, .. } = self {
            if !p.ids.is_empty() {
                let ids: Vec<String> = p.ids.iter().map(|id| id.to_string()).collect();
                params.push(("ids".to_string(), ids.join(",")));
            }
            if let Some(att_id) = p.att_id {
                params.push(("att_id".to_string(), att_id.to_string()));
            }
        }
        params
    }

    /// Path plus encoded query, as shown in a location bar.
    pub fn to_location(&self) -> String {
        let Ok(mut url) = Url::parse(BASE) else {
            return self.path();
        };
        url.set_path(&self.path());
        let params = self.params();
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        url[Position::BeforePath..].to_string()
    }
}
