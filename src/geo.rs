//! Great-circle distance, geofence checks and the geolocation watcher.

use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::types::{Coords, UserId};

/// Mean Earth radius used by the Haversine formula
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance in meters between two points (Haversine, spherical Earth)
pub fn distance_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push `a` a hair outside [0, 1] near antipodes
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

pub fn distance_between(a: Coords, b: Coords) -> f64 {
    distance_meters(a.lat, a.lng, b.lat, b.lng)
}

/// Result of comparing a position against a mission target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeofenceCheck {
    pub distance_m: f64,
    pub radius_m: f64,
    pub inside: bool,
}

pub fn check_geofence(target: Coords, radius_m: f64, position: Coords) -> GeofenceCheck {
    let distance_m = distance_between(target, position);
    GeofenceCheck {
        distance_m,
        radius_m,
        inside: distance_m <= radius_m,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum GeoError {
    #[error("geolocation is not supported on this device")]
    UnsupportedCapability,
    #[error("permission to read the position was denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("timed out while waiting for a position")]
    Timeout,
}

impl GeoError {
    /// Map a W3C `GeolocationPositionError.code` onto the taxonomy
    pub fn from_platform_code(code: u16) -> Self {
        match code {
            1 => GeoError::PermissionDenied,
            3 => GeoError::Timeout,
            _ => GeoError::PositionUnavailable,
        }
    }
}

/// What a watcher exposes to its caller
#[derive(Debug, Clone, PartialEq)]
pub struct GeoState {
    pub coords: Option<Coords>,
    pub loading: bool,
    pub error: Option<GeoError>,
}

impl Default for GeoState {
    fn default() -> Self {
        Self {
            coords: None,
            loading: true,
            error: None,
        }
    }
}

pub type PositionStream = BoxStream<'static, Result<Coords, GeoError>>;

/// Continuous high-accuracy position sampling capability
pub trait PositionSource: Send + Sync {
    /// Begin sampling. Fails with `UnsupportedCapability` when there is nothing to sample.
    fn watch(&self) -> Result<PositionStream, GeoError>;
}

/// Source for environments without any location capability
pub struct NoPositionSource;

impl PositionSource for NoPositionSource {
    fn watch(&self) -> Result<PositionStream, GeoError> {
        Err(GeoError::UnsupportedCapability)
    }
}

/// A fix or platform error reported by a player's device
#[derive(Debug, Clone)]
pub struct PositionReport {
    pub user_id: UserId,
    pub fix: Result<Coords, GeoError>,
}

/// Positions of one player, taken from the in-process report feed
pub struct FeedPositionSource {
    feed: broadcast::Sender<PositionReport>,
    user_id: UserId,
}

impl FeedPositionSource {
    pub fn new(feed: broadcast::Sender<PositionReport>, user_id: UserId) -> Self {
        Self { feed, user_id }
    }
}

impl PositionSource for FeedPositionSource {
    fn watch(&self) -> Result<PositionStream, GeoError> {
        let rx = self.feed.subscribe();
        let user_id = self.user_id.clone();

        let stream = futures::stream::unfold(rx, move |mut rx| {
            let user_id = user_id.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(report) if report.user_id == user_id => return Some((report.fix, rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Position watcher for {} lagged by {}", user_id, skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}

/// Keeps the latest position of a source available to callers.
///
/// Every platform update replaces the exposed state. Stopping (or dropping) the
/// watcher cancels the subscription; its receiver goes away with it, so no
/// update can be observed afterwards.
pub struct GeolocationWatcher {
    state: watch::Receiver<GeoState>,
    task: Option<JoinHandle<()>>,
}

impl GeolocationWatcher {
    pub fn start(source: &dyn PositionSource) -> Self {
        let (tx, rx) = watch::channel(GeoState::default());

        let task = match source.watch() {
            Ok(mut updates) => Some(tokio::spawn(async move {
                while let Some(update) = updates.next().await {
                    tx.send_modify(|state| {
                        state.loading = false;
                        match update {
                            Ok(coords) => {
                                state.coords = Some(coords);
                                state.error = None;
                            }
                            Err(e) => state.error = Some(e),
                        }
                    });
                }
            })),
            Err(e) => {
                tracing::warn!("Geolocation unavailable: {}", e);
                tx.send_replace(GeoState {
                    coords: None,
                    loading: false,
                    error: Some(e),
                });
                None
            }
        };

        Self { state: rx, task }
    }

    /// Snapshot of the latest state
    pub fn current(&self) -> GeoState {
        self.state.borrow().clone()
    }

    /// Wait for the next update. `None` once the source has ended.
    pub async fn changed(&mut self) -> Option<GeoState> {
        self.state.changed().await.ok()?;
        Some(self.state.borrow_and_update().clone())
    }

    pub fn stop(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for GeolocationWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const NOTRE_DAME: Coords = Coords {
        lat: 48.8530,
        lng: 2.3499,
    };
    const TOUR_EIFFEL: Coords = Coords {
        lat: 48.8584,
        lng: 2.2945,
    };

    struct ChannelSource(std::sync::Mutex<Option<mpsc::Receiver<Result<Coords, GeoError>>>>);

    impl PositionSource for ChannelSource {
        fn watch(&self) -> Result<PositionStream, GeoError> {
            let rx = self
                .0
                .lock()
                .unwrap()
                .take()
                .ok_or(GeoError::UnsupportedCapability)?;
            Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed())
        }
    }

    fn channel_source() -> (mpsc::Sender<Result<Coords, GeoError>>, ChannelSource) {
        let (tx, rx) = mpsc::channel(8);
        (tx, ChannelSource(std::sync::Mutex::new(Some(rx))))
    }

    #[test]
    fn test_identical_points_are_zero() {
        assert_eq!(distance_meters(48.8566, 2.3522, 48.8566, 2.3522), 0.0);
        assert_eq!(distance_meters(-33.9, 151.2, -33.9, 151.2), 0.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let pairs = [
            (48.8566, 2.3522, 48.8584, 2.2945),
            (0.0, 0.0, 10.0, 10.0),
            (-45.0, 170.0, 45.0, -170.0),
        ];
        for (a, b, c, d) in pairs {
            let there = distance_meters(a, b, c, d);
            let back = distance_meters(c, d, a, b);
            assert!((there - back).abs() < 1e-6, "{} vs {}", there, back);
        }
    }

    #[test]
    fn test_hotel_de_ville_to_tour_eiffel() {
        let d = distance_meters(48.8566, 2.3522, 48.8584, 2.2945);
        assert!((d - 4226.0).abs() < 4226.0 * 0.01, "got {}", d);
    }

    #[test]
    fn test_antipodal_points_are_half_circumference() {
        let d = distance_meters(0.0, 0.0, 0.0, 180.0);
        let half = std::f64::consts::PI * EARTH_RADIUS_METERS;
        assert!((d - half).abs() < 1.0);
    }

    #[test]
    fn test_distance_grows_along_meridian() {
        let mut last = 0.0;
        for step in 1..=90 {
            let d = distance_meters(0.0, 0.0, step as f64 * 2.0, 0.0);
            assert!(d > last, "not increasing at step {}", step);
            last = d;
        }
    }

    #[test]
    fn test_geofence() {
        let near = Coords::new(48.8586, 2.2945);
        let check = check_geofence(TOUR_EIFFEL, 100.0, near);
        assert!(check.inside);
        assert!(check.distance_m < 30.0);

        let check = check_geofence(TOUR_EIFFEL, 100.0, NOTRE_DAME);
        assert!(!check.inside);
        assert_eq!(check.radius_m, 100.0);
    }

    #[test]
    fn test_platform_codes() {
        assert_eq!(GeoError::from_platform_code(1), GeoError::PermissionDenied);
        assert_eq!(GeoError::from_platform_code(2), GeoError::PositionUnavailable);
        assert_eq!(GeoError::from_platform_code(3), GeoError::Timeout);
    }

    #[tokio::test]
    async fn test_watcher_unsupported() {
        let watcher = GeolocationWatcher::start(&NoPositionSource);
        let state = watcher.current();
        assert!(!state.loading);
        assert_eq!(state.error, Some(GeoError::UnsupportedCapability));
        assert!(state.coords.is_none());
    }

    #[tokio::test]
    async fn test_watcher_tracks_updates() {
        let (tx, source) = channel_source();
        let mut watcher = GeolocationWatcher::start(&source);
        assert!(watcher.current().loading);

        tx.send(Ok(NOTRE_DAME)).await.unwrap();
        let state = watcher.changed().await.unwrap();
        assert_eq!(state.coords, Some(NOTRE_DAME));
        assert!(!state.loading);

        tx.send(Err(GeoError::Timeout)).await.unwrap();
        let state = watcher.changed().await.unwrap();
        assert_eq!(state.error, Some(GeoError::Timeout));
        // Last good fix is kept alongside the error
        assert_eq!(state.coords, Some(NOTRE_DAME));

        tx.send(Ok(TOUR_EIFFEL)).await.unwrap();
        let state = watcher.changed().await.unwrap();
        assert_eq!(state.coords, Some(TOUR_EIFFEL));
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_watcher_stop_cancels_subscription() {
        let (tx, source) = channel_source();
        let watcher = GeolocationWatcher::start(&source);
        watcher.stop();

        // The consuming task is gone, so the channel closes
        tokio::time::timeout(std::time::Duration::from_secs(1), tx.closed())
            .await
            .expect("subscription should be released after stop");
        assert!(tx.send(Ok(NOTRE_DAME)).await.is_err());
    }

    #[tokio::test]
    async fn test_feed_source_filters_by_player() {
        let (feed, _keep) = broadcast::channel(16);
        let source = FeedPositionSource::new(feed.clone(), "alice".to_string());
        let mut watcher = GeolocationWatcher::start(&source);

        feed.send(PositionReport {
            user_id: "bob".to_string(),
            fix: Ok(NOTRE_DAME),
        })
        .unwrap();
        feed.send(PositionReport {
            user_id: "alice".to_string(),
            fix: Ok(TOUR_EIFFEL),
        })
        .unwrap();

        let state = watcher.changed().await.unwrap();
        assert_eq!(state.coords, Some(TOUR_EIFFEL));
    }
}
