// HTTP implementation of the collaborator contracts against the remote
// booking service's JSON API. All anti-automation and challenge traffic
// is classified here, never solved: the engine only sees the taxonomy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{
    AuthError, BookingBackend, Credentials, ResolveError, ScanError, SessionHandle, SubmitReply,
    UserPrompt,
};
use crate::constraints::{DateWindow, LocationQuery};
use crate::model::{GeoPoint, Recipient, ResourceKind, SequenceStage, Site, Slot};

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                          Chrome/89.0.4389.114 Safari/537.36";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Pagination guard: the availability endpoint chains `next_slot` hints
/// and a misbehaving server must not keep us walking forever.
const MAX_AVAILABILITY_PAGES: usize = 12;

pub struct RemoteBackend {
    http: reqwest::Client,
    base_url: String,
    /// Used only for the second-factor challenge during login.
    prompt: Arc<dyn UserPrompt>,
}

impl RemoteBackend {
    pub fn new(base_url: impl Into<String>, prompt: Arc<dyn UserPrompt>) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            prompt,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

// ---- wire types -----------------------------------------------------------

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    kind: &'static str,
    username: &'a str,
    password: &'a str,
    remember: bool,
}

#[derive(Debug, Deserialize)]
struct LoginReply {
    token: Option<String>,
    #[serde(default)]
    redirection: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChallengeReply {
    token: String,
}

#[derive(Debug, Deserialize)]
struct PlacesReply {
    places: Vec<PlaceDto>,
}

#[derive(Debug, Deserialize)]
struct PlaceDto {
    id: String,
    name: String,
    zipcode: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    booking_path: String,
}

impl From<PlaceDto> for Site {
    fn from(place: PlaceDto) -> Self {
        let location = match (place.latitude, place.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint {
                latitude,
                longitude,
            }),
            _ => None,
        };
        Site {
            id: place.id,
            name: place.name,
            postal_code: place.zipcode,
            location,
            booking_handle: place.booking_path,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AvailabilitiesReply {
    #[serde(default)]
    availabilities: Vec<AvailabilityDayDto>,
    /// Hint pointing at the next date with openings, if any.
    #[serde(default)]
    next_slot: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct AvailabilityDayDto {
    #[allow(dead_code)]
    date: NaiveDate,
    #[serde(default)]
    slots: Vec<SlotDto>,
}

#[derive(Debug, Deserialize)]
struct SlotDto {
    start_date: DateTime<Utc>,
    kind: String,
    stage: SequenceStage,
    #[serde(default)]
    linked: Vec<DateTime<Utc>>,
    #[serde(default)]
    min_age: Option<u32>,
    booking_ref: String,
}

impl SlotDto {
    fn into_slot(self, site_id: &str) -> Slot {
        Slot {
            site_id: site_id.to_string(),
            start: self.start_date,
            kind: ResourceKind::new(self.kind),
            stage: self.stage,
            follow_ups: self.linked,
            min_age: self.min_age,
            booking_ref: self.booking_ref,
        }
    }
}

#[derive(Debug, Serialize)]
struct BookingRequest<'a> {
    booking_ref: &'a str,
    recipient_id: &'a str,
    start_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    second_factor: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct BookingReply {
    status: BookingStatus,
    #[serde(default)]
    confirmation_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum BookingStatus {
    Confirmed,
    Gone,
    Refused,
    SecondFactorRequired,
}

#[derive(Debug, Deserialize)]
struct RecipientDto {
    id: String,
    first_name: String,
    last_name: String,
    #[serde(default)]
    birth_date: Option<NaiveDate>,
    #[serde(default)]
    doses_received: u8,
}

impl From<RecipientDto> for Recipient {
    fn from(dto: RecipientDto) -> Self {
        Recipient {
            id: dto.id,
            display_name: format!("{} {}", dto.first_name, dto.last_name),
            birth_date: dto.birth_date,
            doses_received: dto.doses_received,
        }
    }
}

// ---- classification -------------------------------------------------------

/// The service fronts its API with an anti-automation layer; a blocked
/// request surfaces as 503/520 with a challenge marker in the body.
fn looks_blocked(status: StatusCode, body: &str) -> bool {
    (status == StatusCode::SERVICE_UNAVAILABLE || status.as_u16() == 520)
        && (body.contains("challenge") || body.contains("Checking your browser"))
}

fn classify_scan_status(status: StatusCode, body: &str) -> ScanError {
    if looks_blocked(status, body) {
        return ScanError::Transient("blocked by anti-automation challenge".to_string());
    }
    match status {
        StatusCode::UNAUTHORIZED => ScanError::SessionExpired,
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            ScanError::Permanent(format!("HTTP {status}"))
        }
        s if s.is_server_error() => ScanError::Transient(format!("HTTP {s}")),
        s => ScanError::Transient(format!("unexpected HTTP {s}")),
    }
}

fn transport_error(err: reqwest::Error) -> ScanError {
    ScanError::Transient(err.to_string())
}

// ---- trait implementation -------------------------------------------------

#[async_trait]
impl BookingBackend for RemoteBackend {
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionHandle, AuthError> {
        let response = self
            .http
            .post(self.url("/login.json"))
            .json(&LoginRequest {
                kind: "patient",
                username: &credentials.username,
                password: &credentials.password,
                remember: true,
            })
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if looks_blocked(status, &body) {
            return Err(AuthError::Blocked(
                "request blocked before reaching the service".to_string(),
            ));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::InvalidCredentials);
        }
        if !status.is_success() {
            return Err(AuthError::Network(format!("HTTP {status}")));
        }

        let reply: LoginReply =
            serde_json::from_str(&body).map_err(|e| AuthError::Network(e.to_string()))?;

        if reply.redirection.as_deref() == Some("/sessions/two-factor") {
            return self.complete_second_factor().await;
        }

        reply
            .token
            .map(SessionHandle::new)
            .ok_or(AuthError::InvalidCredentials)
    }

    async fn refresh_session(&self, session: &mut SessionHandle) -> Result<(), AuthError> {
        let response = self
            .http
            .post(self.url("/sessions/refresh.json"))
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::InvalidCredentials),
            s if s.is_success() => {
                let reply: ChallengeReply = response
                    .json()
                    .await
                    .map_err(|e| AuthError::Network(e.to_string()))?;
                session.token = reply.token;
                Ok(())
            }
            s => Err(AuthError::Network(format!("HTTP {s}"))),
        }
    }

    async fn resolve_locations(&self, query: &LocationQuery) -> Result<Vec<Site>, ResolveError> {
        let mut request = self
            .http
            .get(self.url("/places.json"))
            .query(&[("query", query.name.as_str())])
            .query(&[("neighbors", query.include_neighbors)]);
        if let Some(postal) = &query.postal_hint {
            request = request.query(&[("zipcode", postal.as_str())]);
        }

        let response = request.send().await.map_err(|e| ResolveError::Transport {
            query: query.name.clone(),
            message: e.to_string(),
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ResolveError::UnknownPlace {
                query: query.name.clone(),
            }),
            s if s.is_success() => {
                let reply: PlacesReply =
                    response.json().await.map_err(|e| ResolveError::Transport {
                        query: query.name.clone(),
                        message: e.to_string(),
                    })?;
                if reply.places.is_empty() {
                    return Err(ResolveError::UnknownPlace {
                        query: query.name.clone(),
                    });
                }
                Ok(reply.places.into_iter().map(Site::from).collect())
            }
            s => Err(ResolveError::Transport {
                query: query.name.clone(),
                message: format!("HTTP {s}"),
            }),
        }
    }

    async fn list_slots(
        &self,
        site: &Site,
        window: &DateWindow,
        session: &SessionHandle,
    ) -> Result<Vec<Slot>, ScanError> {
        let mut slots = Vec::new();
        let mut from = window.start();

        // The endpoint answers a few days at a time and points at the
        // next date with openings; follow the chain through the window.
        for _ in 0..MAX_AVAILABILITY_PAGES {
            let response = self
                .http
                .get(self.url("/availabilities.json"))
                .bearer_auth(&session.token)
                .query(&[
                    ("site", site.booking_handle.as_str()),
                    ("start_date", &from.to_string()),
                    ("end_date", &window.end().to_string()),
                ])
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_scan_status(status, &body));
            }

            let reply: AvailabilitiesReply = response
                .json()
                .await
                .map_err(|e| ScanError::Transient(e.to_string()))?;

            for day in reply.availabilities {
                slots.extend(day.slots.into_iter().map(|dto| dto.into_slot(&site.id)));
            }

            match reply.next_slot {
                Some(next) if next > from && next <= window.end() => from = next,
                _ => break,
            }
        }

        debug!(site = %site.name, slots = slots.len(), "availability snapshot fetched");
        Ok(slots)
    }

    async fn submit_booking(
        &self,
        slot: &Slot,
        recipient: &Recipient,
        session: &SessionHandle,
        second_factor: Option<&str>,
    ) -> Result<SubmitReply, ScanError> {
        let response = self
            .http
            .post(self.url("/appointments.json"))
            .bearer_auth(&session.token)
            .json(&BookingRequest {
                booking_ref: &slot.booking_ref,
                recipient_id: &recipient.id,
                start_date: slot.start,
                second_factor,
            })
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        // The service reports a lost race as 409 on this endpoint.
        if status == StatusCode::CONFLICT {
            return Ok(SubmitReply::Gone);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_scan_status(status, &body));
        }

        let reply: BookingReply = response
            .json()
            .await
            .map_err(|e| ScanError::Transient(e.to_string()))?;

        Ok(match reply.status {
            BookingStatus::Confirmed => SubmitReply::Confirmed {
                confirmation_code: reply.confirmation_code,
            },
            BookingStatus::Gone => SubmitReply::Gone,
            BookingStatus::Refused => {
                SubmitReply::Refused(reply.message.unwrap_or_else(|| "refused".to_string()))
            }
            BookingStatus::SecondFactorRequired => SubmitReply::SecondFactorRequired,
        })
    }

    async fn list_recipients(&self, session: &SessionHandle) -> Result<Vec<Recipient>, ScanError> {
        let response = self
            .http
            .get(self.url("/account/patients.json"))
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_scan_status(status, &body));
        }

        let dtos: Vec<RecipientDto> = response
            .json()
            .await
            .map_err(|e| ScanError::Transient(e.to_string()))?;
        Ok(dtos.into_iter().map(Recipient::from).collect())
    }
}

impl RemoteBackend {
    async fn complete_second_factor(&self) -> Result<SessionHandle, AuthError> {
        // Ask the service to send the code, then relay whatever the
        // prompt collaborator obtains.
        let sent = self
            .http
            .post(self.url("/api/accounts/send_auth_code"))
            .json(&serde_json::json!({ "method": "email" }))
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        if !sent.status().is_success() {
            return Err(AuthError::Network(format!("HTTP {}", sent.status())));
        }

        let Some(code) = self.prompt.request_second_factor().await else {
            warn!("second-factor code required but none available");
            return Err(AuthError::SecondFactorRejected);
        };

        let response = self
            .http
            .post(self.url("/login/challenge"))
            .json(&serde_json::json!({ "auth_code": code, "method": "email" }))
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(AuthError::SecondFactorRejected)
            }
            s if s.is_success() => {
                let reply: ChallengeReply = response
                    .json()
                    .await
                    .map_err(|e| AuthError::Network(e.to_string()))?;
                Ok(SessionHandle::new(reply.token))
            }
            s => Err(AuthError::Network(format!("HTTP {s}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_reply_parses_slots_and_next_hint() {
        let json = r#"{
            "availabilities": [
                {
                    "date": "2021-06-03",
                    "slots": [
                        {
                            "start_date": "2021-06-03T10:00:00Z",
                            "kind": "Pfizer",
                            "stage": "first",
                            "linked": ["2021-07-01T10:00:00Z"],
                            "min_age": 18,
                            "booking_ref": "abc123"
                        }
                    ]
                },
                { "date": "2021-06-04", "slots": [] }
            ],
            "next_slot": "2021-06-09"
        }"#;

        let reply: AvailabilitiesReply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.availabilities.len(), 2);
        assert_eq!(reply.next_slot, Some("2021-06-09".parse().unwrap()));

        let slot = reply.availabilities[0].slots[0].clone_into_test_slot();
        assert_eq!(slot.kind, ResourceKind::new("pfizer"));
        assert_eq!(slot.stage, SequenceStage::First);
        assert_eq!(slot.follow_ups.len(), 1);
        assert_eq!(slot.min_age, Some(18));
    }

    impl SlotDto {
        fn clone_into_test_slot(&self) -> Slot {
            SlotDto {
                start_date: self.start_date,
                kind: self.kind.clone(),
                stage: self.stage,
                linked: self.linked.clone(),
                min_age: self.min_age,
                booking_ref: self.booking_ref.clone(),
            }
            .into_slot("site-1")
        }
    }

    #[test]
    fn empty_availability_reply_is_not_an_error() {
        let reply: AvailabilitiesReply = serde_json::from_str("{}").unwrap();
        assert!(reply.availabilities.is_empty());
        assert!(reply.next_slot.is_none());
    }

    #[test]
    fn booking_reply_statuses_deserialize() {
        let confirmed: BookingReply =
            serde_json::from_str(r#"{"status":"confirmed","confirmation_code":"C9"}"#).unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert_eq!(confirmed.confirmation_code.as_deref(), Some("C9"));

        let second: BookingReply =
            serde_json::from_str(r#"{"status":"second_factor_required"}"#).unwrap();
        assert_eq!(second.status, BookingStatus::SecondFactorRequired);
    }

    #[test]
    fn place_without_coordinates_maps_to_site_without_location() {
        let json = r#"{
            "id": "42",
            "name": "Centre Gerland",
            "zipcode": "69007",
            "booking_path": "/centre/42"
        }"#;
        let site: Site = serde_json::from_str::<PlaceDto>(json).unwrap().into();
        assert!(site.location.is_none());
        assert_eq!(site.booking_handle, "/centre/42");
    }

    #[test]
    fn blocked_responses_classify_as_transient() {
        let err = classify_scan_status(
            StatusCode::SERVICE_UNAVAILABLE,
            "<html>Checking your browser before accessing</html>",
        );
        assert!(matches!(err, ScanError::Transient(_)));
    }

    #[test]
    fn gone_sites_classify_as_permanent_and_expiry_as_session() {
        assert!(matches!(
            classify_scan_status(StatusCode::GONE, ""),
            ScanError::Permanent(_)
        ));
        assert!(matches!(
            classify_scan_status(StatusCode::UNAUTHORIZED, ""),
            ScanError::SessionExpired
        ));
        assert!(matches!(
            classify_scan_status(StatusCode::BAD_GATEWAY, ""),
            ScanError::Transient(_)
        ));
    }

    #[test]
    fn recipient_dto_builds_display_name() {
        let json = r#"{"id":"p1","first_name":"Jane","last_name":"Doe","doses_received":1}"#;
        let recipient: Recipient = serde_json::from_str::<RecipientDto>(json).unwrap().into();
        assert_eq!(recipient.display_name, "Jane Doe");
        assert_eq!(recipient.doses_received, 1);
    }
}
