/// Holding-register client
///
/// Wraps a [`FrameTransport`] with the function 0x03 request/response cycle:
/// build the request, exchange it within the configured timeout, validate
/// the reply and decode the register values. Recoverable failures are
/// retried up to `retries` times inside the same call; every attempt lands in
/// the operation log.
use log::{debug, warn};
use std::time::Duration;

use crate::config::AcquisitionConfig;
use crate::error::{ThermoError, ThermoResult};
use crate::logging::{OperationLog, OperationStatus, OperationType};
use crate::protocol::{
    build_read_holding_registers_frame, parse_response, ModbusAddress, ModbusFunction, SlaveId,
};
use crate::transport::{FrameTransport, TransportStats};
use crate::utils::format::registers_to_hex;
use crate::utils::OperationTimer;

pub struct HoldingRegisterClient<T: FrameTransport> {
    transport: T,
    slave_id: SlaveId,
    timeout: Duration,
    retries: u32,
    operation_log: OperationLog,
}

impl<T: FrameTransport> HoldingRegisterClient<T> {
    pub fn new(transport: T, slave_id: SlaveId, timeout: Duration) -> Self {
        Self {
            transport,
            slave_id,
            timeout,
            retries: 0,
            operation_log: OperationLog::default(),
        }
    }

    /// Client using the slave id, timeout and retry count of `config`
    pub fn from_config(transport: T, config: &AcquisitionConfig) -> Self {
        Self::new(transport, config.slave_id, config.timeout()).with_retries(config.retries)
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Record attempts into a shared log instead of a private one
    pub fn with_operation_log(mut self, operation_log: OperationLog) -> Self {
        self.operation_log = operation_log;
        self
    }

    pub fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn operation_log(&self) -> &OperationLog {
        &self.operation_log
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Read `quantity` consecutive holding registers starting at `address`
    pub async fn read_holding_registers(
        &mut self,
        address: ModbusAddress,
        quantity: u16,
    ) -> ThermoResult<Vec<u16>> {
        let request = build_read_holding_registers_frame(self.slave_id, address, quantity)?;
        let attempts = self.retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let timer = OperationTimer::start("read holding registers");
            let result = self.exchange(&request, quantity).await;
            let elapsed = timer.stop();

            match result {
                Ok(values) => {
                    self.operation_log.record(
                        OperationType::Read,
                        OperationStatus::Success,
                        format!(
                            "Slave {} read {} registers at {}: {} ({:?})",
                            self.slave_id,
                            quantity,
                            address,
                            registers_to_hex(&values),
                            elapsed
                        ),
                    );
                    return Ok(values);
                }
                Err(e) => {
                    let status = match e {
                        ThermoError::Timeout { .. } => OperationStatus::Timeout,
                        _ => OperationStatus::Error,
                    };
                    self.operation_log.record(
                        OperationType::Read,
                        status,
                        format!(
                            "Slave {} read {} registers at {} (attempt {}/{}): {}",
                            self.slave_id, quantity, address, attempt, attempts, e
                        ),
                    );

                    if attempt < attempts && e.is_recoverable() {
                        warn!("Retrying read at {} after: {}", address, e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn exchange(&mut self, request: &[u8], quantity: u16) -> ThermoResult<Vec<u16>> {
        let frame = self.transport.transact(request, self.timeout).await?;
        let response = parse_response(&frame, self.slave_id, ModbusFunction::ReadHoldingRegisters)?;
        let values = response.registers(quantity)?;
        debug!("Slave {} returned {:?}", self.slave_id, values);
        Ok(values)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn close(&mut self) -> ThermoResult<()> {
        self.transport.close().await
    }

    pub fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_read_holding_registers_response, compute_crc16};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedTransport {
        replies: VecDeque<ThermoResult<Vec<u8>>>,
        requests: Vec<Vec<u8>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<ThermoResult<Vec<u8>>>) -> Self {
            Self {
                replies: replies.into(),
                requests: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl FrameTransport for ScriptedTransport {
        async fn transact(&mut self, request: &[u8], timeout: Duration) -> ThermoResult<Vec<u8>> {
            self.requests.push(request.to_vec());
            self.replies
                .pop_front()
                .unwrap_or_else(|| Err(ThermoError::timeout("scripted", timeout.as_millis() as u64)))
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&mut self) -> ThermoResult<()> {
            Ok(())
        }

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn timeout() -> ThermoResult<Vec<u8>> {
        Err(ThermoError::timeout("scripted", 1000))
    }

    #[tokio::test]
    async fn test_read_success() {
        let transport = ScriptedTransport::new(vec![Ok(build_read_holding_registers_response(
            1,
            &[0x0190, 0xFE70],
        ))]);
        let mut client = HoldingRegisterClient::new(transport, 1, Duration::from_secs(1));

        let values = client.read_holding_registers(0, 2).await.unwrap();
        assert_eq!(values, vec![0x0190, 0xFE70]);
        assert_eq!(
            client.transport().requests[0],
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]
        );
        assert_eq!(client.operation_log().count(OperationStatus::Success), 1);
    }

    #[tokio::test]
    async fn test_timeout_without_retries() {
        let transport = ScriptedTransport::new(vec![timeout()]);
        let mut client = HoldingRegisterClient::new(transport, 1, Duration::from_secs(1));

        let result = client.read_holding_registers(0, 1).await;
        assert!(matches!(result, Err(ThermoError::Timeout { .. })));
        assert_eq!(client.transport().requests.len(), 1);
        assert_eq!(client.operation_log().count(OperationStatus::Timeout), 1);
    }

    #[tokio::test]
    async fn test_retries_recoverable_errors() {
        let mut corrupted = build_read_holding_registers_response(1, &[7]);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;

        let transport = ScriptedTransport::new(vec![
            timeout(),
            Ok(corrupted),
            Ok(build_read_holding_registers_response(1, &[7])),
        ]);
        let mut client = HoldingRegisterClient::new(transport, 1, Duration::from_secs(1)).with_retries(2);

        assert_eq!(client.read_holding_registers(10, 1).await.unwrap(), vec![7]);
        assert_eq!(client.transport().requests.len(), 3);
        let entries = client.operation_log().entries();
        assert_eq!(
            entries.iter().map(|e| e.status).collect::<Vec<_>>(),
            vec![OperationStatus::Timeout, OperationStatus::Error, OperationStatus::Success]
        );
    }

    #[tokio::test]
    async fn test_no_retry_for_wrong_slave() {
        let transport = ScriptedTransport::new(vec![
            Ok(build_read_holding_registers_response(2, &[7])),
            Ok(build_read_holding_registers_response(1, &[7])),
        ]);
        let mut client = HoldingRegisterClient::new(transport, 1, Duration::from_secs(1)).with_retries(3);

        let result = client.read_holding_registers(0, 1).await;
        assert!(matches!(result, Err(ThermoError::SlaveMismatch { expected: 1, actual: 2 })));
        assert_eq!(client.transport().requests.len(), 1);
    }

    #[tokio::test]
    async fn test_exception_response() {
        let mut frame = vec![0x01, 0x83, 0x02];
        let crc = compute_crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        let transport = ScriptedTransport::new(vec![Ok(frame)]);
        let mut client = HoldingRegisterClient::new(transport, 1, Duration::from_secs(1));
        let result = client.read_holding_registers(0, 1).await;
        assert!(matches!(result, Err(ThermoError::Exception { code: 0x02, .. })));
    }

    #[tokio::test]
    async fn test_wrong_register_count() {
        let transport = ScriptedTransport::new(vec![Ok(build_read_holding_registers_response(1, &[1, 2]))]);
        let mut client = HoldingRegisterClient::new(transport, 1, Duration::from_secs(1));
        let result = client.read_holding_registers(0, 3).await;
        assert!(matches!(result, Err(ThermoError::Frame { .. })));
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_sent() {
        let transport = ScriptedTransport::new(vec![]);
        let mut client = HoldingRegisterClient::new(transport, 0, Duration::from_secs(1));
        assert!(client.read_holding_registers(0, 1).await.is_err());
        assert!(client.transport().requests.is_empty());
    }
}
