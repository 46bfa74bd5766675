//! Account-model chain access over `ethers`.
//!
//! [`EthNode`] backs the address-based engine: per-user addresses are derived
//! from the configured mnemonic, sweeps and payouts are signed locally and
//! submitted raw. [`Erc20Node`] backs the token engine against a single
//! contract, scanning `Transfer` logs into the root address.

use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Middleware, Provider, Ws};
use ethers::signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockId, BlockNumber, TransactionRequest, H256, U256, U64};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::chain::{AccountNode, Depth, NonceKind, SweepOutcome, TokenNode, TokenTransfer};
use crate::error::{ProxyError, ProxyResult};

abigen!(
    Erc20Contract,
    r#"[
        function balanceOf(address owner) external view returns (uint256)
        function transfer(address to, uint256 value) external returns (bool)
        event Transfer(address indexed from, address indexed to, uint256 value)
    ]"#
);

fn rpc_err<E: std::fmt::Display>(error: E) -> ProxyError {
    ProxyError::ChainRpc(error.to_string())
}

fn u256_units(value: U256) -> ProxyResult<Decimal> {
    Decimal::from_str(&value.to_string())
        .map_err(|_| ProxyError::MalformedResponse(format!("chain value out of range: {value}")))
}

fn units_u256(value: Decimal) -> ProxyResult<U256> {
    U256::from_dec_str(&value.normalize().to_string())
        .map_err(|_| ProxyError::InvalidAmount(format!("not a unit amount: {value}")))
}

fn format_address(address: Address) -> String {
    format!("{address:?}")
}

fn derive_wallet(mnemonic: &str, index: u32, chain_id: u64) -> ProxyResult<LocalWallet> {
    let wallet = MnemonicBuilder::<English>::default()
        .phrase(mnemonic)
        .index(index)
        .map_err(|e| ProxyError::Config(format!("bad derivation index {index}: {e}")))?
        .build()
        .map_err(|e| ProxyError::Config(format!("bad mnemonic: {e}")))?;
    Ok(wallet.with_chain_id(chain_id))
}

pub struct EthNode {
    provider: Provider<Ws>,
    chain_id: u64,
    mnemonic: String,
    gas_units: u64,
    root: LocalWallet,
    root_address: String,
}

impl EthNode {
    pub async fn connect(url: &str, mnemonic: &str, gas_units: u64) -> ProxyResult<Self> {
        let provider = Provider::<Ws>::connect(url).await.map_err(rpc_err)?;
        let chain_id = provider.get_chainid().await.map_err(rpc_err)?.as_u64();
        let root = derive_wallet(mnemonic, 0, chain_id)?;
        let root_address = format_address(root.address());
        Ok(EthNode {
            provider,
            chain_id,
            mnemonic: mnemonic.to_string(),
            gas_units,
            root,
            root_address,
        })
    }

    async fn block_id(&self, depth: Depth) -> ProxyResult<BlockId> {
        Ok(match depth {
            Depth::Pending => BlockNumber::Pending.into(),
            Depth::Latest => BlockNumber::Latest.into(),
            Depth::Confirmed(n) => {
                let head = self.provider.get_block_number().await.map_err(rpc_err)?;
                BlockId::Number(BlockNumber::Number(head.saturating_sub(U64::from(n))))
            }
        })
    }

    async fn sign_and_submit(
        &self,
        wallet: &LocalWallet,
        to: Address,
        value: U256,
        gas_price: U256,
    ) -> ProxyResult<(H256, ethers::types::Bytes)> {
        let nonce = self
            .provider
            .get_transaction_count(wallet.address(), Some(BlockNumber::Pending.into()))
            .await
            .map_err(rpc_err)?;
        let request = TransactionRequest::new()
            .to(to)
            .value(value)
            .gas(self.gas_units)
            .gas_price(gas_price)
            .nonce(nonce)
            .chain_id(self.chain_id);
        let typed: TypedTransaction = request.into();
        let signature = wallet.sign_transaction(&typed).await.map_err(rpc_err)?;
        let raw = typed.rlp_signed(&signature);
        let tx_hash = H256::from(ethers::utils::keccak256(&raw));
        Ok((tx_hash, raw))
    }
}

#[async_trait]
impl AccountNode for EthNode {
    fn root_address(&self) -> &str {
        &self.root_address
    }

    fn address_at(&self, index: u32) -> ProxyResult<String> {
        let wallet = derive_wallet(&self.mnemonic, index, self.chain_id)?;
        Ok(format_address(wallet.address()))
    }

    fn is_address(&self, candidate: &str) -> bool {
        candidate.parse::<Address>().is_ok()
    }

    async fn balance(&self, address: &str, depth: Depth) -> ProxyResult<Decimal> {
        let address = address
            .parse::<Address>()
            .map_err(|_| ProxyError::InvalidAddress(address.to_string()))?;
        let block = self.block_id(depth).await?;
        let balance = self
            .provider
            .get_balance(address, Some(block))
            .await
            .map_err(rpc_err)?;
        u256_units(balance)
    }

    async fn gas_price(&self) -> ProxyResult<Decimal> {
        u256_units(self.provider.get_gas_price().await.map_err(rpc_err)?)
    }

    async fn nonce(&self, kind: NonceKind) -> ProxyResult<u64> {
        let block = match kind {
            NonceKind::Pending => BlockNumber::Pending,
            NonceKind::Latest => BlockNumber::Latest,
        };
        let count = self
            .provider
            .get_transaction_count(self.root.address(), Some(block.into()))
            .await
            .map_err(rpc_err)?;
        Ok(count.as_u64())
    }

    async fn sweep(
        &self,
        index: u32,
        value: Decimal,
        gas_price: Decimal,
    ) -> ProxyResult<SweepOutcome> {
        let wallet = derive_wallet(&self.mnemonic, index, self.chain_id)?;
        let (_, raw) = self
            .sign_and_submit(&wallet, self.root.address(), units_u256(value)?, units_u256(gas_price)?)
            .await?;
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(rpc_err)?;
        let receipt = pending
            .await
            .map_err(rpc_err)?
            .ok_or_else(|| ProxyError::MalformedResponse("sweep dropped without receipt".into()))?;
        let block_height = receipt
            .block_number
            .ok_or_else(|| ProxyError::MalformedResponse("receipt without block number".into()))?;
        let block = self
            .provider
            .get_block(BlockId::Number(BlockNumber::Number(block_height)))
            .await
            .map_err(rpc_err)?
            .ok_or_else(|| ProxyError::MalformedResponse("receipt block not found".into()))?;
        Ok(SweepOutcome {
            tx_hash: format!("{:?}", receipt.transaction_hash),
            block_hash: receipt.block_hash.map(|h| format!("{h:?}")),
            block_height: block_height.as_u64(),
            block_time: block.timestamp.as_u64() as i64,
        })
    }

    async fn pay(&self, to: &str, value: Decimal, gas_price: Decimal) -> ProxyResult<String> {
        let to = to
            .parse::<Address>()
            .map_err(|_| ProxyError::InvalidAddress(to.to_string()))?;
        let (tx_hash, raw) = self
            .sign_and_submit(&self.root, to, units_u256(value)?, units_u256(gas_price)?)
            .await?;
        // The signed hash is known before broadcast, so a replay of the same
        // payout produces the same hash and the ledger commit stays idempotent.
        self.provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| ProxyError::ChainReject(format!("submission rejected: {e}")))?;
        Ok(format!("{tx_hash:?}"))
    }
}

pub struct Erc20Node {
    provider: Provider<Ws>,
    read: Erc20Contract<Provider<Ws>>,
    write: Erc20Contract<SignerMiddleware<Provider<Ws>, LocalWallet>>,
    root: Address,
    root_address: String,
}

impl Erc20Node {
    pub async fn connect(url: &str, mnemonic: &str, contract_address: &str) -> ProxyResult<Self> {
        let provider = Provider::<Ws>::connect(url).await.map_err(rpc_err)?;
        let chain_id = provider.get_chainid().await.map_err(rpc_err)?.as_u64();
        let wallet = derive_wallet(mnemonic, 0, chain_id)?;
        let root = wallet.address();
        let contract: Address = contract_address
            .parse()
            .map_err(|_| ProxyError::Config(format!("bad contract address: {contract_address}")))?;
        let read = Erc20Contract::new(contract, Arc::new(provider.clone()));
        let signer = SignerMiddleware::new(provider.clone(), wallet);
        let write = Erc20Contract::new(contract, Arc::new(signer));
        Ok(Erc20Node {
            provider,
            read,
            write,
            root,
            root_address: format_address(root),
        })
    }
}

#[async_trait]
impl TokenNode for Erc20Node {
    fn root_address(&self) -> &str {
        &self.root_address
    }

    fn is_address(&self, candidate: &str) -> bool {
        candidate.parse::<Address>().is_ok()
    }

    async fn latest_block(&self) -> ProxyResult<u64> {
        Ok(self
            .provider
            .get_block_number()
            .await
            .map_err(rpc_err)?
            .as_u64())
    }

    async fn transfers_to_root(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> ProxyResult<Vec<TokenTransfer>> {
        let events = self
            .read
            .transfer_filter()
            .from_block(from_block)
            .to_block(to_block);
        let logs = events.query_with_meta().await.map_err(rpc_err)?;

        let mut block_times: HashMap<u64, i64> = HashMap::new();
        let mut transfers = Vec::new();
        for (event, meta) in logs {
            if event.to != self.root {
                continue;
            }
            let height = meta.block_number.as_u64();
            let time = match block_times.get(&height) {
                Some(t) => *t,
                None => {
                    let block = self
                        .provider
                        .get_block(BlockId::Number(BlockNumber::Number(meta.block_number)))
                        .await
                        .map_err(rpc_err)?
                        .ok_or_else(|| {
                            ProxyError::MalformedResponse(format!("log block {height} not found"))
                        })?;
                    let t = block.timestamp.as_u64() as i64;
                    block_times.insert(height, t);
                    t
                }
            };
            transfers.push(TokenTransfer {
                value: u256_units(event.value)?,
                tx_hash: format!("{:?}", meta.transaction_hash),
                block_hash: format!("{:?}", meta.block_hash),
                block_height: height,
                block_time: time,
            });
        }
        transfers.sort_by_key(|t| t.block_height);
        Ok(transfers)
    }

    async fn root_token_balance(&self) -> ProxyResult<Decimal> {
        let balance = self
            .read
            .balance_of(self.root)
            .call()
            .await
            .map_err(rpc_err)?;
        u256_units(balance)
    }

    async fn transfer(&self, to: &str, value: Decimal) -> ProxyResult<String> {
        let to = to
            .parse::<Address>()
            .map_err(|_| ProxyError::InvalidAddress(to.to_string()))?;
        let call = self.write.transfer(to, units_u256(value)?);
        let pending = call
            .send()
            .await
            .map_err(|e| ProxyError::ChainReject(format!("token transfer rejected: {e}")))?;
        let tx_hash: H256 = *pending;
        Ok(format!("{tx_hash:?}"))
    }
}
