//! Projects decoded token events into balance and supply deltas.
//!
//! Pure and position-blind: ordering and idempotency are the batch writer's
//! and import loop's concern. Sign conventions: mint and transfer-in are
//! positive, burn and transfer-out are negative. Only plain accounts hold
//! explorer-visible balances; contract-held tokens change supply but produce
//! no account entry.

use bigdecimal::BigDecimal;
use num_bigint::{BigInt, BigUint};

use crate::indexer::types::{
    AccountBalanceUpdate, Address, ContractAddress, TokenEvent, TokenId, TokenUpdate,
    TokenUpdateKind,
};

/// Everything one event contributes to the materialized view.
#[derive(Debug, Default, PartialEq)]
pub struct Projection {
    pub token: Option<TokenUpdate>,
    pub balances: Vec<AccountBalanceUpdate>,
}

/// Turn one decoded event from `contract` into row deltas.
pub fn project(contract: ContractAddress, event: &TokenEvent) -> Projection {
    match event {
        TokenEvent::Mint {
            token_id,
            amount,
            owner,
        } => signed_supply_change(contract, token_id, amount, owner, Sign::Positive),
        TokenEvent::Burn {
            token_id,
            amount,
            owner,
        } => signed_supply_change(contract, token_id, amount, owner, Sign::Negative),
        TokenEvent::Transfer {
            token_id,
            amount,
            from,
            to,
        } => {
            // Supply is unchanged; each account-typed side gets its own
            // entry. A self-transfer yields two entries, not a netted zero.
            let mut balances = Vec::new();
            if let Address::Account(sender) = from {
                balances.push(AccountBalanceUpdate {
                    contract,
                    token_id: token_id.clone(),
                    account: *sender,
                    delta: -to_decimal(amount),
                });
            }
            if let Address::Account(receiver) = to {
                balances.push(AccountBalanceUpdate {
                    contract,
                    token_id: token_id.clone(),
                    account: *receiver,
                    delta: to_decimal(amount),
                });
            }
            Projection {
                token: None,
                balances,
            }
        }
        TokenEvent::TokenMetadata {
            token_id,
            metadata_url,
            metadata_hash,
        } => Projection {
            token: Some(TokenUpdate {
                contract,
                token_id: token_id.clone(),
                kind: TokenUpdateKind::Metadata {
                    url: metadata_url.clone(),
                    hash: metadata_hash.as_ref().map(hex::encode),
                },
            }),
            balances: Vec::new(),
        },
        // Operator approvals do not touch balances or supply.
        TokenEvent::UpdateOperator { .. } => Projection::default(),
    }
}

enum Sign {
    Positive,
    Negative,
}

fn signed_supply_change(
    contract: ContractAddress,
    token_id: &TokenId,
    amount: &BigUint,
    owner: &Address,
    sign: Sign,
) -> Projection {
    let delta = match sign {
        Sign::Positive => to_decimal(amount),
        Sign::Negative => -to_decimal(amount),
    };
    let balances = match owner {
        Address::Account(account) => vec![AccountBalanceUpdate {
            contract,
            token_id: token_id.clone(),
            account: *account,
            delta: delta.clone(),
        }],
        Address::Contract(_) => Vec::new(),
    };
    Projection {
        token: Some(TokenUpdate {
            contract,
            token_id: token_id.clone(),
            kind: TokenUpdateKind::SupplyDelta(delta),
        }),
        balances,
    }
}

fn to_decimal(amount: &BigUint) -> BigDecimal {
    BigDecimal::from(BigInt::from(amount.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::types::AccountAddress;

    fn contract() -> ContractAddress {
        ContractAddress::new(99, 0)
    }

    fn account(byte: u8) -> Address {
        Address::Account(AccountAddress([byte; 32]))
    }

    fn other_contract(index: u64) -> Address {
        Address::Contract(ContractAddress::new(index, 0))
    }

    fn token() -> TokenId {
        TokenId::new(vec![0x01])
    }

    fn amount(n: u64) -> BigUint {
        BigUint::from(n)
    }

    fn decimal(n: i64) -> BigDecimal {
        BigDecimal::from(n)
    }

    fn supply_delta(projection: &Projection) -> &BigDecimal {
        match &projection.token {
            Some(TokenUpdate {
                kind: TokenUpdateKind::SupplyDelta(delta),
                ..
            }) => delta,
            other => panic!("expected supply delta, got {other:?}"),
        }
    }

    #[test]
    fn transfer_between_accounts_yields_two_balance_entries() {
        let projection = project(
            contract(),
            &TokenEvent::Transfer {
                token_id: token(),
                amount: amount(500),
                from: account(1),
                to: account(2),
            },
        );
        assert!(projection.token.is_none());
        assert_eq!(projection.balances.len(), 2);
        assert_eq!(projection.balances[0].account, AccountAddress([1; 32]));
        assert_eq!(projection.balances[0].delta, decimal(-500));
        assert_eq!(projection.balances[1].account, AccountAddress([2; 32]));
        assert_eq!(projection.balances[1].delta, decimal(500));
    }

    #[test]
    fn transfer_between_contracts_yields_nothing() {
        let projection = project(
            contract(),
            &TokenEvent::Transfer {
                token_id: token(),
                amount: amount(500),
                from: other_contract(1),
                to: other_contract(2),
            },
        );
        assert_eq!(projection, Projection::default());
    }

    #[test]
    fn transfer_with_contract_sender_credits_only_the_account() {
        let projection = project(
            contract(),
            &TokenEvent::Transfer {
                token_id: token(),
                amount: amount(7),
                from: other_contract(1),
                to: account(2),
            },
        );
        assert!(projection.token.is_none());
        assert_eq!(projection.balances.len(), 1);
        assert_eq!(projection.balances[0].delta, decimal(7));
    }

    #[test]
    fn self_transfer_is_not_netted() {
        let projection = project(
            contract(),
            &TokenEvent::Transfer {
                token_id: token(),
                amount: amount(10),
                from: account(5),
                to: account(5),
            },
        );
        assert_eq!(projection.balances.len(), 2);
        assert_eq!(projection.balances[0].delta, decimal(-10));
        assert_eq!(projection.balances[1].delta, decimal(10));
    }

    #[test]
    fn mint_to_account_raises_supply_and_balance() {
        let projection = project(
            contract(),
            &TokenEvent::Mint {
                token_id: token(),
                amount: amount(100),
                owner: account(1),
            },
        );
        assert_eq!(supply_delta(&projection), &decimal(100));
        assert_eq!(projection.balances.len(), 1);
        assert_eq!(projection.balances[0].delta, decimal(100));
    }

    #[test]
    fn burn_from_account_lowers_supply_and_balance() {
        let projection = project(
            contract(),
            &TokenEvent::Burn {
                token_id: token(),
                amount: amount(30),
                owner: account(1),
            },
        );
        assert_eq!(supply_delta(&projection), &decimal(-30));
        assert_eq!(projection.balances.len(), 1);
        assert_eq!(projection.balances[0].delta, decimal(-30));
    }

    #[test]
    fn burn_from_contract_lowers_supply_only() {
        let projection = project(
            contract(),
            &TokenEvent::Burn {
                token_id: token(),
                amount: amount(30),
                owner: other_contract(4),
            },
        );
        assert_eq!(supply_delta(&projection), &decimal(-30));
        assert!(projection.balances.is_empty());
    }

    #[test]
    fn metadata_update_replaces_url_without_supply_change() {
        let projection = project(
            contract(),
            &TokenEvent::TokenMetadata {
                token_id: token(),
                metadata_url: "https://tokens.example/1.json".to_string(),
                metadata_hash: Some([0xab; 32]),
            },
        );
        assert!(projection.balances.is_empty());
        match projection.token {
            Some(TokenUpdate {
                kind: TokenUpdateKind::Metadata { url, hash },
                ..
            }) => {
                assert_eq!(url, "https://tokens.example/1.json");
                assert_eq!(hash.as_deref(), Some(hex::encode([0xab; 32]).as_str()));
            }
            other => panic!("expected metadata update, got {other:?}"),
        }
    }

    #[test]
    fn update_operator_projects_nothing() {
        let projection = project(
            contract(),
            &TokenEvent::UpdateOperator {
                update: crate::indexer::types::OperatorUpdate::Add,
                owner: account(1),
                operator: account(2),
            },
        );
        assert_eq!(projection, Projection::default());
    }
}
