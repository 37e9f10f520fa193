//! Built-in handlers.

use agvlink_commands::MovementCommand;
use agvlink_core::{Error, OperatingState, Request, Response, Result, VehicleStateReport};
use async_trait::async_trait;

use crate::router::Handler;

/// Separator between position and operating state in a position report.
pub const POSITION_FIELD_SEPARATOR: char = ';';

/// Turns a position report telegram into an adapter operation.
///
/// Payload: `position[;operating_state]`.
#[derive(Debug, Clone, Default)]
pub struct PositionReportHandler {
    acknowledge: bool,
}

impl PositionReportHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo the reported position back to the vehicle.
    pub fn acknowledging(mut self) -> Self {
        self.acknowledge = true;
        self
    }

    /// Parse a position report payload.
    pub fn parse(payload: &str) -> Result<VehicleStateReport> {
        let mut fields = payload.splitn(2, POSITION_FIELD_SEPARATOR);
        let position = fields.next().unwrap_or_default().trim();
        if position.is_empty() {
            return Err(Error::InvalidState("position report without position".into()));
        }
        let state = fields
            .next()
            .map(|s| s.parse::<OperatingState>().unwrap_or_default())
            .unwrap_or(OperatingState::Executing);
        Ok(VehicleStateReport::new(position, state))
    }
}

#[async_trait]
impl Handler for PositionReportHandler {
    async fn handle(&self, request: Request, response: Response) -> Result<Response> {
        let protocol = request
            .protocol
            .as_ref()
            .ok_or_else(|| Error::InvalidState("position report without telegram".into()))?;
        let report = Self::parse(&protocol.payload)?;
        tracing::debug!(
            device = %protocol.device_id,
            position = %report.position,
            state = ?report.operating_state,
            "Position report"
        );

        let payload = report.position.clone();
        let response = response.with_vehicle_state(report);
        Ok(if self.acknowledge {
            response.send(payload)
        } else {
            response
        })
    }
}

/// Renders a move request into an outbound route telegram.
///
/// Route payload: `A>B>C`, with `@operation` appended when the final step
/// carries one.
#[derive(Debug, Clone)]
pub struct MoveTelegramHandler {
    command_key: String,
}

impl MoveTelegramHandler {
    pub fn new(command_key: impl Into<String>) -> Self {
        Self {
            command_key: command_key.into(),
        }
    }

    /// Render a step list as a route.
    pub fn render_route(commands: &[MovementCommand]) -> Result<String> {
        let (first, _) = commands
            .split_first()
            .ok_or_else(|| Error::InvalidState("move request without steps".into()))?;

        let mut route = first.source_point.clone();
        for cmd in commands {
            route.push('>');
            route.push_str(&cmd.destination_point);
        }
        if let Some(last) = commands.last().filter(|c| c.needs_action()) {
            route.push('@');
            route.push_str(last.operation.trim());
        }
        Ok(route)
    }
}

#[async_trait]
impl Handler for MoveTelegramHandler {
    async fn handle(&self, request: Request, mut response: Response) -> Result<Response> {
        let payload = request.payload.as_deref().unwrap_or_default();
        let commands: Vec<MovementCommand> = serde_json::from_str(payload)
            .map_err(|e| Error::InvalidState(format!("invalid move request: {}", e)))?;
        let route = Self::render_route(&commands)?;
        tracing::info!(vehicle = %request.device_id(), route = %route, "Move request rendered");

        response.command_key = self.command_key.clone();
        Ok(response.send(route))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agvlink_core::{Protocol, RequestKind};

    #[tokio::test]
    async fn test_position_report() {
        let handler = PositionReportHandler::new();
        let request = Request::telegram(
            "agv-1,rptpos,5,0,P3;idle",
            Protocol::new("agv-1", "rptpos", "5").with_payload("P3;idle"),
        );
        let response = handler
            .handle(request.clone(), Response::for_request(&request))
            .await
            .unwrap();

        assert!(response.needs_adapter_operation);
        assert!(!response.needs_send);
        let state = response.vehicle_state.unwrap();
        assert_eq!(state.position, "P3");
        assert_eq!(state.operating_state, OperatingState::Idle);
    }

    #[tokio::test]
    async fn test_acknowledging_position_report() {
        let handler = PositionReportHandler::new().acknowledging();
        let request = Request::telegram("", Protocol::new("agv-1", "rptpos", "5").with_payload("P3"));
        let response = handler
            .handle(request.clone(), Response::for_request(&request))
            .await
            .unwrap();
        assert!(response.needs_send);
        assert_eq!(response.payload, "P3");
        assert_eq!(response.code, "5");
    }

    #[test]
    fn test_empty_position_rejected() {
        assert!(PositionReportHandler::parse("").is_err());
        assert!(PositionReportHandler::parse(" ;idle").is_err());
        assert_eq!(
            PositionReportHandler::parse("A").unwrap().operating_state,
            OperatingState::Executing
        );
    }

    #[tokio::test]
    async fn test_move_request_rendering() {
        let steps = vec![
            MovementCommand::new("A", "B"),
            MovementCommand::new("B", "C").with_operation("Load").as_final(),
        ];
        let payload = serde_json::to_string(&steps).unwrap();
        let request = Request::synthetic(RequestKind::Move, "agv-1", payload);

        let handler = MoveTelegramHandler::new("setrout");
        let response = handler
            .handle(request.clone(), Response::for_request(&request))
            .await
            .unwrap();
        assert_eq!(response.command_key, "setrout");
        assert_eq!(response.payload, "A>B>C@Load");
        assert!(response.needs_send);
        assert_eq!(response.device_id, "agv-1");
    }

    #[test]
    fn test_empty_route_rejected() {
        assert!(MoveTelegramHandler::render_route(&[]).is_err());
    }
}
