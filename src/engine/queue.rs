use crate::engine::dispatch::DispatchCoordinator;
use crate::error::DispatchError;
use crate::models::outcome::MatchRequest;

pub async fn enqueue_match_request(
    coordinator: &DispatchCoordinator,
    request: MatchRequest,
) -> Result<(), DispatchError> {
    coordinator.metrics().match_requests_in_queue.inc();

    if coordinator.match_sender().send(request).await.is_err() {
        coordinator.metrics().match_requests_in_queue.dec();
        return Err(DispatchError::QueueClosed);
    }
    Ok(())
}
