/// Register address resolution
///
/// Turns a [`SerialConfig`] into the ordered list of channels to poll, each
/// with the logical address shown to the user and the physical address sent
/// on the wire, and groups contiguous physical addresses into read blocks.
use serde::{Deserialize, Serialize};

use crate::config::SerialConfig;
use crate::protocol::ModbusAddress;

/// One channel mapped to a holding register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRegister {
    /// Channel number, starting at 1
    pub channel: u8,
    /// Address as configured (e.g. 40001)
    pub logical_address: ModbusAddress,
    /// Address used in the request frame
    pub physical_address: ModbusAddress,
}

/// Contiguous run of registers fetched with one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlock {
    pub start: ModbusAddress,
    /// Registers in address order; `registers[i]` lives at `start + i`
    pub registers: Vec<ResolvedRegister>,
}

impl ReadBlock {
    pub fn quantity(&self) -> u16 {
        self.registers.len() as u16
    }

    pub fn channels(&self) -> impl Iterator<Item = u8> + '_ {
        self.registers.iter().map(|register| register.channel)
    }
}

/// Apply the holding-register bias to a configured address
pub fn physical_address(logical: ModbusAddress, offset_address: ModbusAddress) -> ModbusAddress {
    if offset_address > 0 && logical >= offset_address {
        logical - offset_address
    } else {
        logical
    }
}

/// Resolve the channels described by `config`
///
/// A non-empty custom register list wins over start/count and is truncated
/// to 16 entries; otherwise `registerCount` consecutive addresses from
/// `startRegister` are used (stopping at the top of the address space).
pub fn resolve(config: &SerialConfig) -> Vec<ResolvedRegister> {
    let logical: Vec<ModbusAddress> = match config.custom_list() {
        Some(registers) => registers.iter().copied().take(crate::MAX_CHANNELS).collect(),
        None => {
            let count = (config.register_count as usize).min(crate::MAX_CHANNELS);
            (0..count)
                .map_while(|i| config.start_register.checked_add(i as u16))
                .collect()
        }
    };

    logical
        .into_iter()
        .enumerate()
        .map(|(index, address)| ResolvedRegister {
            channel: (index + 1) as u8,
            logical_address: address,
            physical_address: physical_address(address, config.offset_address),
        })
        .collect()
}

/// Parse a user-entered register list such as `"40001, 40003 40010"`
///
/// Non-numeric and out-of-range entries are dropped; at most 16 are kept.
pub fn parse_custom_registers(text: &str) -> Vec<ModbusAddress> {
    text.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse::<i64>().ok())
        .filter_map(|value| ModbusAddress::try_from(value).ok())
        .take(crate::MAX_CHANNELS)
        .collect()
}

/// Group `registers` into contiguous read blocks
///
/// Registers are taken in the given order; a new block starts whenever the
/// next physical address is not the successor of the previous one or the
/// block reached `max_per_request`.
pub fn plan_reads(registers: &[ResolvedRegister], max_per_request: u16) -> Vec<ReadBlock> {
    let max_per_request = max_per_request.max(1) as usize;
    let mut blocks: Vec<ReadBlock> = Vec::new();

    for register in registers {
        match blocks.last_mut() {
            Some(block)
                if block.registers.len() < max_per_request
                    && block.start as u32 + block.registers.len() as u32
                        == register.physical_address as u32 =>
            {
                block.registers.push(*register);
            }
            _ => blocks.push(ReadBlock {
                start: register.physical_address,
                registers: vec![*register],
            }),
        }
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(start: u16, count: u16, offset: u16) -> SerialConfig {
        SerialConfig {
            start_register: start,
            register_count: count,
            offset_address: offset,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_start_and_count() {
        let resolved = resolve(&config(100, 3, 0));
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0].channel, 1);
        assert_eq!(resolved[2].channel, 3);
        assert_eq!(
            resolved.iter().map(|r| r.physical_address).collect::<Vec<_>>(),
            vec![100, 101, 102]
        );
    }

    #[test]
    fn test_resolve_with_offset() {
        let resolved = resolve(&config(40001, 2, 40001));
        assert_eq!(resolved[0].logical_address, 40001);
        assert_eq!(resolved[0].physical_address, 0);
        assert_eq!(resolved[1].physical_address, 1);

        // Addresses below the bias are sent unshifted
        let resolved = resolve(&config(5, 1, 40001));
        assert_eq!(resolved[0].physical_address, 5);
    }

    #[test]
    fn test_resolve_custom_registers() {
        let mut serial = config(0, 4, 40001);
        serial.custom_registers = Some(vec![40010, 40002, 7]);
        let resolved = resolve(&serial);
        assert_eq!(resolved.len(), 3);
        assert_eq!(
            resolved.iter().map(|r| (r.channel, r.physical_address)).collect::<Vec<_>>(),
            vec![(1, 9), (2, 1), (3, 7)]
        );

        serial.custom_registers = Some(Vec::new());
        assert_eq!(resolve(&serial).len(), 4);
    }

    #[test]
    fn test_resolve_caps_channels() {
        assert_eq!(resolve(&config(0, 40, 0)).len(), 16);
        assert_eq!(resolve(&config(65534, 4, 0)).len(), 2);
    }

    #[test]
    fn test_parse_custom_registers() {
        assert_eq!(parse_custom_registers("1, 2,3 ;4"), vec![1, 2, 3, 4]);
        assert_eq!(parse_custom_registers("10, abc, -5, 70000, 20"), vec![10, 20]);
        assert!(parse_custom_registers("").is_empty());

        let many: Vec<String> = (0..30).map(|i| i.to_string()).collect();
        assert_eq!(parse_custom_registers(&many.join(",")).len(), 16);
    }

    #[test]
    fn test_plan_reads_contiguous() {
        let resolved = resolve(&config(40001, 8, 40001));
        let blocks = plan_reads(&resolved, 125);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start, 0);
        assert_eq!(blocks[0].quantity(), 8);
    }

    #[test]
    fn test_plan_reads_scattered() {
        let mut serial = config(0, 0, 0);
        serial.custom_registers = Some(vec![10, 11, 20, 5]);
        let blocks = plan_reads(&resolve(&serial), 125);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].channels().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(blocks[1].start, 20);
        assert_eq!(blocks[2].start, 5);
    }

    #[test]
    fn test_plan_reads_respects_limit() {
        let resolved = resolve(&config(0, 10, 0));
        let blocks = plan_reads(&resolved, 4);
        assert_eq!(
            blocks.iter().map(|b| b.quantity()).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
        assert_eq!(blocks[2].start, 8);
    }
}
