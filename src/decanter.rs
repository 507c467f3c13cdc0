//! Decanter: Single-file Solana program with embedded pooled-fund engine.
//!
//! Depositors pool collateral into a share-accounted fund; the fund owner
//! originates maker-signed structured-product trades against that pool, and
//! settlement at expiry releases committed collateral back to the pool with
//! fees accrued from realized gains. Withdrawals go through a time-locked
//! single-slot redemption queue and pay out at claim-time share price.

#![no_std]
#![deny(unsafe_code)]

extern crate alloc;

pub mod engine;

#[cfg(not(feature = "no-entrypoint"))]
solana_security_txt::security_txt! {
    name: "Decanter",
    project_url: "https://github.com/decanter-fund/decanter-prog",
    contacts: "email:security@decanter.fund",
    policy: "https://github.com/decanter-fund/decanter-prog/blob/master/SECURITY.md",
    preferred_languages: "en"
}

// 1. mod constants
pub mod constants {
    use crate::engine::FundEngine;
    use crate::state::FundConfig;
    use core::mem::{align_of, size_of};

    pub const MAGIC: u64 = 0x444543414e544552; // "DECANTER"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = 64;
    pub const CONFIG_LEN: usize = size_of::<FundConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<FundEngine>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = FundEngine::size();
    pub const SLAB_LEN: usize = ENGINE_OFF + ENGINE_LEN;

    /// Collateral kinds for `FundConfig.collateral_kind`
    pub const COLLATERAL_PLAIN: u8 = 0;
    pub const COLLATERAL_WRAPPED: u8 = 1;

    /// Fixed-offset layout of the settlement oracle account (see `oracle`)
    pub const ORACLE_HEADER_LEN: usize = 8;
    pub const ORACLE_ENTRY_LEN: usize = 24;

    /// Fixed-offset layout of a venue settlement account (see `venue`)
    pub const VENUE_SETTLEMENT_LEN: usize = 48;

    /// Fixed-offset layout of a wrapper state account (see `collateral`)
    pub const WRAPPER_STATE_LEN: usize = 8;

    /// Upper bound on instructions scanned during ed25519 introspection
    pub const MAX_TX_INSTRUCTIONS: usize = 24;
}

// 2. mod zc (Zero-Copy unsafe island)
#[allow(unsafe_code)]
pub mod zc {
    use crate::constants::{ENGINE_ALIGN, ENGINE_LEN, ENGINE_OFF};
    use crate::engine::FundEngine;
    use solana_program::program_error::ProgramError;

    #[inline]
    pub fn engine_ref<'a>(data: &'a [u8]) -> Result<&'a FundEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &*(ptr as *const FundEngine) })
    }

    #[inline]
    pub fn engine_mut<'a>(data: &'a mut [u8]) -> Result<&'a mut FundEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &mut *(ptr as *mut FundEngine) })
    }
}

// 3. mod error
pub mod error {
    use crate::engine::FundError;
    use num_derive::FromPrimitive;
    use solana_program::decode_error::DecodeError;
    use solana_program::program_error::ProgramError;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
    pub enum DecanterError {
        InvalidMagic,
        InvalidVersion,
        AlreadyInitialized,
        NotInitialized,
        InvalidSlabLen,
        ExpectedSigner,
        ExpectedWritable,
        Unauthorized,
        InvalidVaultAta,
        InvalidEscrowAta,
        InvalidPayoutAta,
        InvalidMint,
        InvalidMakerSignature,
        InvalidOracleAccount,
        OracleNotSettled,
        InvalidVenueAccount,
        InvalidWrapperState,
        MixedVenueBatch,
        InvalidParams,
        // Engine errors mapped:
        FundZeroAmount,
        FundAmountTooSmall,
        FundInsufficientShares,
        FundInsufficientCollateral,
        FundInsufficientCollateralToRedeem,
        FundRedemptionAlreadyPending,
        FundNoPendingRedemption,
        FundRedemptionLocked,
        FundInvalidTransferAmount,
        FundOrderExpired,
        FundOrderAlreadyConsumed,
        FundMakerNotEnabled,
        FundVenueNotEnabled,
        FundInvalidOrder,
        FundPositionNotFound,
        FundPositionNotExpired,
        FundPayoffExceedsCollateral,
        FundZeroFee,
        FundAccountNotFound,
        FundDepositorTableFull,
        FundPositionTableFull,
        FundOrderTableFull,
        FundRegistryFull,
        FundOverflow,
    }

    impl From<DecanterError> for ProgramError {
        fn from(e: DecanterError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for DecanterError {
        fn type_of() -> &'static str {
            "DecanterError"
        }
    }

    pub fn map_fund_error(e: FundError) -> ProgramError {
        let err = match e {
            FundError::ZeroAmount => DecanterError::FundZeroAmount,
            FundError::AmountTooSmall => DecanterError::FundAmountTooSmall,
            FundError::InsufficientShares => DecanterError::FundInsufficientShares,
            FundError::InsufficientCollateral => DecanterError::FundInsufficientCollateral,
            FundError::InsufficientCollateralToRedeem => {
                DecanterError::FundInsufficientCollateralToRedeem
            }
            FundError::RedemptionAlreadyPending => DecanterError::FundRedemptionAlreadyPending,
            FundError::NoPendingRedemption => DecanterError::FundNoPendingRedemption,
            FundError::RedemptionLocked => DecanterError::FundRedemptionLocked,
            FundError::InvalidTransferAmount => DecanterError::FundInvalidTransferAmount,
            FundError::OrderExpired => DecanterError::FundOrderExpired,
            FundError::OrderAlreadyConsumed => DecanterError::FundOrderAlreadyConsumed,
            FundError::MakerNotEnabled => DecanterError::FundMakerNotEnabled,
            FundError::VenueNotEnabled => DecanterError::FundVenueNotEnabled,
            FundError::InvalidOrder => DecanterError::FundInvalidOrder,
            FundError::PositionNotFound => DecanterError::FundPositionNotFound,
            FundError::PositionNotExpired => DecanterError::FundPositionNotExpired,
            FundError::PayoffExceedsCollateral => DecanterError::FundPayoffExceedsCollateral,
            FundError::ZeroFee => DecanterError::FundZeroFee,
            FundError::AccountNotFound => DecanterError::FundAccountNotFound,
            FundError::DepositorTableFull => DecanterError::FundDepositorTableFull,
            FundError::PositionTableFull => DecanterError::FundPositionTableFull,
            FundError::OrderTableFull => DecanterError::FundOrderTableFull,
            FundError::RegistryFull => DecanterError::FundRegistryFull,
            FundError::Overflow => DecanterError::FundOverflow,
        };
        ProgramError::Custom(err as u32)
    }
}

// 4. mod ix
pub mod ix {
    use alloc::vec::Vec;
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    /// A maker-signed order as carried in instruction data. Economic terms
    /// plus the maker's ed25519 signature over the canonical digest.
    #[derive(Clone, Copy, Debug)]
    pub struct SignedOrder {
        pub venue: Pubkey,
        pub maker: Pubkey,
        pub gross_collateral: u64,
        pub maker_collateral: u64,
        pub expiry: i64,
        pub anchor_low: u64,
        pub anchor_high: u64,
        pub risk_bps: u64,
        pub deadline: i64,
        pub signature: [u8; 64],
    }

    /// Position key for a settlement request; the payoff itself is read from
    /// the venue's settlement account, not from instruction data.
    #[derive(Clone, Copy, Debug)]
    pub struct SettleKeyData {
        pub venue: Pubkey,
        pub expiry: i64,
        pub anchor_low: u64,
        pub anchor_high: u64,
        pub risk_bps: u64,
    }

    #[derive(Debug)]
    pub enum Instruction {
        InitFund {
            fee_rate_bps: u64,
            protocol_fee_rate_bps: u64,
            protocol_fee_at_settlement: u8,
            collateral_kind: u8,
            redemption_lock_secs: i64,
            redemption_grace_secs: i64,
            fee_recipient: Pubkey,
            protocol_treasury: Pubkey,
        },
        SetMaker { maker: Pubkey, enabled: u8 },
        SetVenue { venue: Pubkey, enabled: u8 },
        Deposit { amount: u64 },
        Withdraw { shares: u64 },
        ClaimRedemptions,
        TransferShares { to: Pubkey, shares: u64 },
        MintProducts { orders: Vec<SignedOrder> },
        BurnProducts { requests: Vec<SettleKeyData> },
        Harvest,
        CollectProtocolFee,
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input
                .split_first()
                .ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => {
                    let fee_rate_bps = read_u64(&mut rest)?;
                    let protocol_fee_rate_bps = read_u64(&mut rest)?;
                    let protocol_fee_at_settlement = read_u8(&mut rest)?;
                    let collateral_kind = read_u8(&mut rest)?;
                    let redemption_lock_secs = read_i64(&mut rest)?;
                    let redemption_grace_secs = read_i64(&mut rest)?;
                    let fee_recipient = read_pubkey(&mut rest)?;
                    let protocol_treasury = read_pubkey(&mut rest)?;
                    Ok(Instruction::InitFund {
                        fee_rate_bps,
                        protocol_fee_rate_bps,
                        protocol_fee_at_settlement,
                        collateral_kind,
                        redemption_lock_secs,
                        redemption_grace_secs,
                        fee_recipient,
                        protocol_treasury,
                    })
                }
                1 => {
                    let maker = read_pubkey(&mut rest)?;
                    let enabled = read_u8(&mut rest)?;
                    Ok(Instruction::SetMaker { maker, enabled })
                }
                2 => {
                    let venue = read_pubkey(&mut rest)?;
                    let enabled = read_u8(&mut rest)?;
                    Ok(Instruction::SetVenue { venue, enabled })
                }
                3 => {
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Deposit { amount })
                }
                4 => {
                    let shares = read_u64(&mut rest)?;
                    Ok(Instruction::Withdraw { shares })
                }
                5 => Ok(Instruction::ClaimRedemptions),
                6 => {
                    let to = read_pubkey(&mut rest)?;
                    let shares = read_u64(&mut rest)?;
                    Ok(Instruction::TransferShares { to, shares })
                }
                7 => {
                    let count = read_u8(&mut rest)? as usize;
                    let mut orders = Vec::with_capacity(count);
                    for _ in 0..count {
                        orders.push(read_order(&mut rest)?);
                    }
                    Ok(Instruction::MintProducts { orders })
                }
                8 => {
                    let count = read_u8(&mut rest)? as usize;
                    let mut requests = Vec::with_capacity(count);
                    for _ in 0..count {
                        requests.push(read_settle_key(&mut rest)?);
                    }
                    Ok(Instruction::BurnProducts { requests })
                }
                9 => Ok(Instruction::Harvest),
                10 => Ok(Instruction::CollectProtocolFee),
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        let (&val, rest) = input
            .split_first()
            .ok_or(ProgramError::InvalidInstructionData)?;
        *input = rest;
        Ok(val)
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        if input.len() < 8 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_i64(input: &mut &[u8]) -> Result<i64, ProgramError> {
        if input.len() < 8 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        if input.len() < 32 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(32);
        *input = rest;
        Ok(Pubkey::new_from_array(bytes.try_into().unwrap()))
    }

    fn read_signature(input: &mut &[u8]) -> Result<[u8; 64], ProgramError> {
        if input.len() < 64 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(64);
        *input = rest;
        Ok(bytes.try_into().unwrap())
    }

    fn read_order(input: &mut &[u8]) -> Result<SignedOrder, ProgramError> {
        Ok(SignedOrder {
            venue: read_pubkey(input)?,
            maker: read_pubkey(input)?,
            gross_collateral: read_u64(input)?,
            maker_collateral: read_u64(input)?,
            expiry: read_i64(input)?,
            anchor_low: read_u64(input)?,
            anchor_high: read_u64(input)?,
            risk_bps: read_u64(input)?,
            deadline: read_i64(input)?,
            signature: read_signature(input)?,
        })
    }

    fn read_settle_key(input: &mut &[u8]) -> Result<SettleKeyData, ProgramError> {
        Ok(SettleKeyData {
            venue: read_pubkey(input)?,
            expiry: read_i64(input)?,
            anchor_low: read_u64(input)?,
            anchor_high: read_u64(input)?,
            risk_bps: read_u64(input)?,
        })
    }
}

// 5. mod accounts
pub mod accounts {
    use crate::error::DecanterError;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(DecanterError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(DecanterError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], program_id)
    }

    /// Escrow authority for a venue's committed collateral bucket.
    pub fn derive_escrow_authority(
        program_id: &Pubkey,
        slab_key: &Pubkey,
        venue: &Pubkey,
    ) -> (Pubkey, u8) {
        Pubkey::find_program_address(
            &[b"escrow", slab_key.as_ref(), venue.as_ref()],
            program_id,
        )
    }
}

// 6. mod state
pub mod state {
    use crate::constants::{CONFIG_LEN, HEADER_LEN};
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        pub admin: [u8; 32],
        pub _reserved: [u8; 16],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct FundConfig {
        pub collateral_mint: [u8; 32],
        pub vault_pubkey: [u8; 32],
        pub settlement_oracle: [u8; 32],
        pub wrapper_state: [u8; 32],
        pub fee_recipient: [u8; 32],
        pub protocol_treasury: [u8; 32],
        pub collateral_kind: u8,
        pub vault_authority_bump: u8,
        pub _padding: [u8; 6],
    }

    pub fn slab_data_mut<'a, 'b>(
        ai: &'b AccountInfo<'a>,
    ) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        let mut h = SlabHeader::zeroed();
        let src = &data[..HEADER_LEN];
        let dst = bytemuck::bytes_of_mut(&mut h);
        dst.copy_from_slice(src);
        h
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        let src = bytemuck::bytes_of(h);
        let dst = &mut data[..HEADER_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_config(data: &[u8]) -> FundConfig {
        let mut c = FundConfig::zeroed();
        let src = &data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        let dst = bytemuck::bytes_of_mut(&mut c);
        dst.copy_from_slice(src);
        c
    }

    pub fn write_config(data: &mut [u8], c: &FundConfig) {
        let src = bytemuck::bytes_of(c);
        let dst = &mut data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        dst.copy_from_slice(src);
    }
}

// 7. mod oracle
pub mod oracle {
    use crate::constants::{ORACLE_ENTRY_LEN, ORACLE_HEADER_LEN};
    use crate::error::DecanterError;
    use arrayref::array_ref;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    /// Read the settled price for `expiry` from the settlement oracle account.
    ///
    /// Layout: `count: u16` at offset 0, 6 bytes reserved, then `count`
    /// entries of `{ expiry: i64, price_e6: u64, settled_at: i64 }`.
    /// An entry with `settled_at == 0` is published but not yet fixed.
    pub fn read_settled_price(price_ai: &AccountInfo, expiry: i64) -> Result<u64, ProgramError> {
        let data = price_ai.try_borrow_data()?;
        if data.len() < ORACLE_HEADER_LEN {
            return Err(DecanterError::InvalidOracleAccount.into());
        }
        let count = u16::from_le_bytes(*array_ref![data, 0, 2]) as usize;
        if data.len() < ORACLE_HEADER_LEN + count * ORACLE_ENTRY_LEN {
            return Err(DecanterError::InvalidOracleAccount.into());
        }

        for i in 0..count {
            let off = ORACLE_HEADER_LEN + i * ORACLE_ENTRY_LEN;
            let entry_expiry = i64::from_le_bytes(*array_ref![data, off, 8]);
            if entry_expiry != expiry {
                continue;
            }
            let price_e6 = u64::from_le_bytes(*array_ref![data, off + 8, 8]);
            let settled_at = i64::from_le_bytes(*array_ref![data, off + 16, 8]);
            if settled_at == 0 || price_e6 == 0 {
                return Err(DecanterError::OracleNotSettled.into());
            }
            return Ok(price_e6);
        }
        Err(DecanterError::OracleNotSettled.into())
    }
}

// 8. mod venue
pub mod venue {
    use crate::constants::VENUE_SETTLEMENT_LEN;
    use crate::error::DecanterError;
    use arrayref::array_ref;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    /// Read the fund-side payoff fraction from a venue settlement account.
    ///
    /// Layout: `{ expiry: i64, anchor_low: u64, anchor_high: u64,
    /// risk_bps: u64, settled_price_e6: u64, payoff_e6: u64 }`.
    ///
    /// The account must be owned by the venue program — that ownership is the
    /// authorization that the payoff really came from the venue — and its key
    /// fields must match the position being settled. `settled_price_e6` must
    /// agree with the oracle's fixing so the two collaborators cannot diverge.
    pub fn read_payoff_e6(
        settlement_ai: &AccountInfo,
        venue_program: &Pubkey,
        expiry: i64,
        anchor_low: u64,
        anchor_high: u64,
        risk_bps: u64,
        oracle_price_e6: u64,
    ) -> Result<u64, ProgramError> {
        if settlement_ai.owner != venue_program {
            return Err(DecanterError::InvalidVenueAccount.into());
        }
        let data = settlement_ai.try_borrow_data()?;
        if data.len() < VENUE_SETTLEMENT_LEN {
            return Err(DecanterError::InvalidVenueAccount.into());
        }

        let s_expiry = i64::from_le_bytes(*array_ref![data, 0, 8]);
        let s_low = u64::from_le_bytes(*array_ref![data, 8, 8]);
        let s_high = u64::from_le_bytes(*array_ref![data, 16, 8]);
        let s_risk = u64::from_le_bytes(*array_ref![data, 24, 8]);
        let s_price = u64::from_le_bytes(*array_ref![data, 32, 8]);
        let payoff_e6 = u64::from_le_bytes(*array_ref![data, 40, 8]);

        if s_expiry != expiry || s_low != anchor_low || s_high != anchor_high || s_risk != risk_bps
        {
            return Err(DecanterError::InvalidVenueAccount.into());
        }
        if s_price != oracle_price_e6 {
            return Err(DecanterError::InvalidVenueAccount.into());
        }
        Ok(payoff_e6)
    }
}

// 9. mod collateral
pub mod collateral {
    use crate::constants::WRAPPER_STATE_LEN;
    use crate::error::DecanterError;
    use arrayref::array_ref;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(test)]
    use solana_program::program_pack::Pack;
    #[cfg(test)]
    use spl_token::state::Account as TokenAccount;

    /// Transfer tokens into a program-held account, authorized by the payer.
    pub fn deposit<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(
                &ix,
                &[
                    source.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
            )
        }
        #[cfg(test)]
        {
            move_tokens(source, dest, amount)
        }
    }

    /// Transfer tokens out of a program-held account (or via a program
    /// delegate), signed with the given PDA seeds.
    pub fn withdraw<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(
                &ix,
                &[
                    source.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
                _signer_seeds,
            )
        }
        #[cfg(test)]
        {
            move_tokens(source, dest, amount)
        }
    }

    #[cfg(test)]
    fn move_tokens(source: &AccountInfo, dest: &AccountInfo, amount: u64) -> Result<(), ProgramError> {
        let mut src_data = source.try_borrow_mut_data()?;
        let mut src_state = TokenAccount::unpack(&src_data)?;
        src_state.amount = src_state
            .amount
            .checked_sub(amount)
            .ok_or(ProgramError::InsufficientFunds)?;
        TokenAccount::pack(src_state, &mut src_data)?;

        let mut dst_data = dest.try_borrow_mut_data()?;
        let mut dst_state = TokenAccount::unpack(&dst_data)?;
        dst_state.amount = dst_state
            .amount
            .checked_add(amount)
            .ok_or(ProgramError::InvalidAccountData)?;
        TokenAccount::pack(dst_state, &mut dst_data)?;
        Ok(())
    }

    /// Read the wrapper's exchange rate (underlying per wrapper share, e6)
    /// from its state account. The rate is authoritative: the fund never
    /// second-guesses the wrapper's own conversion.
    ///
    /// Layout: `rate_e6: u64` at offset 0.
    pub fn read_wrapper_rate_e6(wrapper_ai: &AccountInfo) -> Result<u64, ProgramError> {
        let data = wrapper_ai.try_borrow_data()?;
        if data.len() < WRAPPER_STATE_LEN {
            return Err(DecanterError::InvalidWrapperState.into());
        }
        let rate_e6 = u64::from_le_bytes(*array_ref![data, 0, 8]);
        if rate_e6 == 0 {
            return Err(DecanterError::InvalidWrapperState.into());
        }
        Ok(rate_e6)
    }
}

// 10. mod sigverify
pub mod sigverify {
    use crate::constants::MAX_TX_INSTRUCTIONS;
    use crate::ix::SignedOrder;
    use solana_program::{
        account_info::AccountInfo, ed25519_program, hash, pubkey::Pubkey,
        sysvar::instructions::load_instruction_at_checked,
    };

    const DOMAIN_TAG: &[u8] = b"decanter:maker-order:v1";

    /// Canonical signed payload for a maker order. Includes the program id
    /// and the fund's slab key so a signature for one fund can never be
    /// replayed against another.
    pub fn order_digest(program_id: &Pubkey, slab: &Pubkey, order: &SignedOrder) -> [u8; 32] {
        hash::hashv(&[
            DOMAIN_TAG,
            program_id.as_ref(),
            slab.as_ref(),
            order.venue.as_ref(),
            order.maker.as_ref(),
            &order.gross_collateral.to_le_bytes(),
            &order.maker_collateral.to_le_bytes(),
            &order.expiry.to_le_bytes(),
            &order.anchor_low.to_le_bytes(),
            &order.anchor_high.to_le_bytes(),
            &order.risk_bps.to_le_bytes(),
            &order.deadline.to_le_bytes(),
        ])
        .to_bytes()
    }

    /// Opaque signature-verification seam: given the claimed signer, the
    /// canonical digest and the signature bytes, decide validity.
    pub trait OrderVerifier {
        fn verify(&self, signer: &[u8; 32], digest: &[u8; 32], signature: &[u8; 64]) -> bool;
    }

    /// Production verifier: the transaction must carry an ed25519-program
    /// instruction whose verified (pubkey, message, signature) triple matches
    /// the order. The runtime has already checked the curve math by the time
    /// this program executes; introspection only has to find the triple.
    pub struct Ed25519Introspection<'a, 'b> {
        pub sysvar: &'b AccountInfo<'a>,
    }

    impl<'a, 'b> OrderVerifier for Ed25519Introspection<'a, 'b> {
        fn verify(&self, signer: &[u8; 32], digest: &[u8; 32], signature: &[u8; 64]) -> bool {
            for ix_index in 0..MAX_TX_INSTRUCTIONS {
                let ix = match load_instruction_at_checked(ix_index, self.sysvar) {
                    Ok(ix) => ix,
                    Err(_) => break, // past the end of the transaction
                };
                if ix.program_id != ed25519_program::ID {
                    continue;
                }
                if entry_matches(&ix.data, ix_index as u16, signer, digest, signature) {
                    return true;
                }
            }
            false
        }
    }

    /// Parse the ed25519 instruction's offset table:
    /// `num_signatures: u8, padding: u8`, then 14-byte entries of
    /// `{ sig_off, sig_ix, pubkey_off, pubkey_ix, msg_off, msg_size, msg_ix }`
    /// (all u16 LE). Only self-referential entries are accepted.
    fn entry_matches(
        data: &[u8],
        self_index: u16,
        signer: &[u8; 32],
        digest: &[u8; 32],
        signature: &[u8; 64],
    ) -> bool {
        if data.len() < 2 {
            return false;
        }
        let num_signatures = data[0] as usize;
        for k in 0..num_signatures {
            let off = 2 + k * 14;
            if data.len() < off + 14 {
                return false;
            }
            let read_u16 =
                |at: usize| u16::from_le_bytes([data[at], data[at + 1]]);
            let sig_off = read_u16(off) as usize;
            let sig_ix = read_u16(off + 2);
            let pk_off = read_u16(off + 4) as usize;
            let pk_ix = read_u16(off + 6);
            let msg_off = read_u16(off + 8) as usize;
            let msg_size = read_u16(off + 10) as usize;
            let msg_ix = read_u16(off + 12);

            let self_ref =
                |ix: u16| ix == u16::MAX || ix == self_index;
            if !self_ref(sig_ix) || !self_ref(pk_ix) || !self_ref(msg_ix) {
                continue;
            }
            if msg_size != 32 {
                continue;
            }
            if data.len() < sig_off + 64 || data.len() < pk_off + 32 || data.len() < msg_off + 32 {
                continue;
            }
            if &data[pk_off..pk_off + 32] == signer.as_ref()
                && &data[msg_off..msg_off + 32] == digest.as_ref()
                && &data[sig_off..sig_off + 64] == signature.as_ref()
            {
                return true;
            }
        }
        false
    }

    /// Deterministic verifier for tests: a signature is "valid" when its
    /// first half is the digest and its second half is the signer key.
    pub struct StaticVerifier;

    impl OrderVerifier for StaticVerifier {
        fn verify(&self, signer: &[u8; 32], digest: &[u8; 32], signature: &[u8; 64]) -> bool {
            signature[..32] == digest[..] && signature[32..] == signer[..]
        }
    }
}

// 11. mod events
pub mod events {
    use alloc::format;
    use solana_program::{msg, pubkey::Pubkey};

    pub fn deposited(depositor: &Pubkey, amount: u64, shares: u128) {
        msg!("decanter:Deposited depositor={} amount={} shares={}", depositor, amount, shares);
    }

    pub fn withdrawn(depositor: &Pubkey, shares: u64) {
        msg!("decanter:Withdrawn depositor={} shares={}", depositor, shares);
    }

    pub fn redemptions_claimed(depositor: &Pubkey, assets: u128, shares: u128) {
        msg!(
            "decanter:RedemptionsClaimed depositor={} assets={} shares={}",
            depositor,
            assets,
            shares
        );
    }

    pub fn shares_transferred(from: &Pubkey, to: &Pubkey, shares: u64) {
        msg!("decanter:SharesTransferred from={} to={} shares={}", from, to, shares);
    }

    pub fn products_minted(venue: &Pubkey, count: usize, committed: u128) {
        msg!("decanter:ProductsMinted venue={} count={} committed={}", venue, count, committed);
    }

    pub fn products_burned(venue: &Pubkey, count: usize, returned: u128) {
        msg!("decanter:ProductsBurned venue={} count={} returned={}", venue, count, returned);
    }

    pub fn fee_collected(recipient: &Pubkey, amount: u128) {
        msg!("decanter:FeeCollected recipient={} amount={}", recipient, amount);
    }

    pub fn protocol_fee_collected(treasury: &Pubkey, amount: u128) {
        msg!("decanter:ProtocolFeeCollected treasury={} amount={}", treasury, amount);
    }
}

// 12. mod processor
pub mod processor {
    use crate::{
        accounts,
        collateral,
        constants::{COLLATERAL_PLAIN, COLLATERAL_WRAPPED, MAGIC, SLAB_LEN, VERSION},
        engine::{
            CollateralAdapter, CollateralSource, FundParams, OrderTerms, PositionKey,
            SettleRequest,
        },
        error::{map_fund_error, DecanterError},
        events,
        ix::{Instruction, SettleKeyData, SignedOrder},
        oracle, sigverify,
        sigverify::OrderVerifier,
        state::{self, FundConfig, SlabHeader},
        venue, zc,
    };
    use alloc::vec::Vec;
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        program_error::ProgramError,
        program_pack::Pack,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        if slab.owner != program_id {
            return Err(ProgramError::IllegalOwner);
        }
        if data.len() != SLAB_LEN {
            return Err(DecanterError::InvalidSlabLen.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(DecanterError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(DecanterError::InvalidVersion.into());
        }
        Ok(())
    }

    fn require_admin(data: &[u8], a_admin: &AccountInfo) -> Result<(), ProgramError> {
        accounts::expect_signer(a_admin)?;
        let h = state::read_header(data);
        if Pubkey::new_from_array(h.admin) != *a_admin.key {
            return Err(DecanterError::Unauthorized.into());
        }
        Ok(())
    }

    fn verify_vault(
        a_vault: &AccountInfo,
        expected_owner: &Pubkey,
        expected_mint: &Pubkey,
        expected_pubkey: &Pubkey,
    ) -> Result<(), ProgramError> {
        if a_vault.key != expected_pubkey {
            return Err(DecanterError::InvalidVaultAta.into());
        }
        if a_vault.owner != &spl_token::ID {
            return Err(DecanterError::InvalidVaultAta.into());
        }
        if a_vault.data_len() != spl_token::state::Account::LEN {
            return Err(DecanterError::InvalidVaultAta.into());
        }

        let data = a_vault.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(DecanterError::InvalidMint.into());
        }
        if tok.owner != *expected_owner {
            return Err(DecanterError::InvalidVaultAta.into());
        }
        Ok(())
    }

    fn verify_escrow(
        a_escrow: &AccountInfo,
        expected_authority: &Pubkey,
        expected_mint: &Pubkey,
    ) -> Result<(), ProgramError> {
        if a_escrow.owner != &spl_token::ID {
            return Err(DecanterError::InvalidEscrowAta.into());
        }
        if a_escrow.data_len() != spl_token::state::Account::LEN {
            return Err(DecanterError::InvalidEscrowAta.into());
        }
        let data = a_escrow.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(DecanterError::InvalidMint.into());
        }
        if tok.owner != *expected_authority {
            return Err(DecanterError::InvalidEscrowAta.into());
        }
        Ok(())
    }

    /// Build the collateral adapter for this fund. Wrapped funds carry their
    /// wrapper state account as the trailing account of every priced
    /// instruction; the exchange rate is read once per operation.
    fn load_adapter(
        config: &FundConfig,
        a_wrapper: Option<&AccountInfo>,
    ) -> Result<CollateralSource, ProgramError> {
        match config.collateral_kind {
            COLLATERAL_PLAIN => Ok(CollateralSource::Plain),
            COLLATERAL_WRAPPED => {
                let ai = a_wrapper.ok_or(DecanterError::InvalidWrapperState)?;
                accounts::expect_key(ai, &Pubkey::new_from_array(config.wrapper_state))
                    .map_err(|_| DecanterError::InvalidWrapperState)?;
                let rate_e6 = collateral::read_wrapper_rate_e6(ai)?;
                Ok(CollateralSource::Wrapped { rate_e6 })
            }
            _ => Err(DecanterError::InvalidWrapperState.into()),
        }
    }

    fn order_terms(order: &SignedOrder) -> OrderTerms {
        OrderTerms {
            venue: order.venue.to_bytes(),
            maker: order.maker.to_bytes(),
            gross_collateral: order.gross_collateral as u128,
            maker_collateral: order.maker_collateral as u128,
            expiry: order.expiry,
            anchor_prices: [order.anchor_low, order.anchor_high],
            risk_bps: order.risk_bps,
            deadline: order.deadline,
        }
    }

    fn settle_key(req: &SettleKeyData) -> PositionKey {
        PositionKey {
            venue: req.venue.to_bytes(),
            expiry: req.expiry,
            anchor_prices: [req.anchor_low, req.anchor_high],
            risk_bps: req.risk_bps,
        }
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitFund {
                fee_rate_bps,
                protocol_fee_rate_bps,
                protocol_fee_at_settlement,
                collateral_kind,
                redemption_lock_secs,
                redemption_grace_secs,
                fee_recipient,
                protocol_treasury,
            } => {
                accounts::expect_len(accounts, 6)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_mint = &accounts[2];
                let a_vault = &accounts[3];
                let a_oracle = &accounts[4];
                let a_wrapper = &accounts[5];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;
                if collateral_kind != COLLATERAL_PLAIN && collateral_kind != COLLATERAL_WRAPPED {
                    return Err(DecanterError::InvalidParams.into());
                }

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC {
                    return Err(DecanterError::AlreadyInitialized.into());
                }

                let (auth, bump) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(a_vault, &auth, a_mint.key, a_vault.key)?;

                let params = FundParams {
                    fee_rate_bps,
                    protocol_fee_rate_bps,
                    protocol_fee_at_settlement,
                    _padding: [0; 7],
                    redemption_lock_secs,
                    redemption_grace_secs,
                };
                params
                    .validate()
                    .map_err(|_| ProgramError::from(DecanterError::InvalidParams))?;

                for b in data.iter_mut() {
                    *b = 0;
                }

                let engine = zc::engine_mut(&mut data)?;
                engine.init_in_place(params);

                let wrapper_state = if collateral_kind == COLLATERAL_WRAPPED {
                    // Rate must be readable at init; a dead wrapper account
                    // would brick every priced operation.
                    collateral::read_wrapper_rate_e6(a_wrapper)?;
                    a_wrapper.key.to_bytes()
                } else {
                    [0; 32]
                };

                let config = FundConfig {
                    collateral_mint: a_mint.key.to_bytes(),
                    vault_pubkey: a_vault.key.to_bytes(),
                    settlement_oracle: a_oracle.key.to_bytes(),
                    wrapper_state,
                    fee_recipient: fee_recipient.to_bytes(),
                    protocol_treasury: protocol_treasury.to_bytes(),
                    collateral_kind,
                    vault_authority_bump: bump,
                    _padding: [0; 6],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    _padding: [0; 3],
                    admin: a_admin.key.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
            }
            Instruction::SetMaker { maker, enabled } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                engine
                    .set_maker(maker.to_bytes(), enabled != 0)
                    .map_err(map_fund_error)?;
            }
            Instruction::SetVenue { venue, enabled } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                engine
                    .set_venue(venue.to_bytes(), enabled != 0)
                    .map_err(map_fund_error)?;
            }
            Instruction::Deposit { amount } => {
                accounts::expect_len(accounts, 5)?;
                let a_depositor = &accounts[0];
                let a_slab = &accounts[1];
                let a_depositor_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_token = &accounts[4];

                accounts::expect_signer(a_depositor)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.collateral_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                let adapter = load_adapter(&config, accounts.get(5))?;
                let engine = zc::engine_mut(&mut data)?;

                collateral::deposit(a_token, a_depositor_ata, a_vault, a_depositor, amount)?;
                let shares = engine
                    .deposit(&a_depositor.key.to_bytes(), amount as u128, &adapter)
                    .map_err(map_fund_error)?;
                events::deposited(a_depositor.key, amount, shares);
            }
            Instruction::Withdraw { shares } => {
                accounts::expect_len(accounts, 3)?;
                let a_depositor = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_depositor)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let clock = Clock::from_account_info(a_clock)?;
                let engine = zc::engine_mut(&mut data)?;
                engine
                    .request_redemption(
                        &a_depositor.key.to_bytes(),
                        shares as u128,
                        clock.unix_timestamp,
                    )
                    .map_err(map_fund_error)?;
                events::withdrawn(a_depositor.key, shares);
            }
            Instruction::ClaimRedemptions => {
                accounts::expect_len(accounts, 7)?;
                let a_depositor = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_depositor_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];

                accounts::expect_signer(a_depositor)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;
                verify_vault(
                    a_vault,
                    &derived_pda,
                    &Pubkey::new_from_array(config.collateral_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                let adapter = load_adapter(&config, accounts.get(7))?;
                let clock = Clock::from_account_info(a_clock)?;
                let engine = zc::engine_mut(&mut data)?;

                // Ledger first, token transfer second: a collaborator calling
                // back in observes the already-debited state.
                let payout = engine
                    .claim_redemptions(&a_depositor.key.to_bytes(), clock.unix_timestamp, &adapter)
                    .map_err(map_fund_error)?;

                let units_u64: u64 = payout
                    .units
                    .try_into()
                    .map_err(|_| ProgramError::from(DecanterError::FundOverflow))?;

                let seed1: &[u8] = b"vault";
                let seed2: &[u8] = a_slab.key.as_ref();
                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seed3: &[u8] = &bump_arr;
                let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                collateral::withdraw(
                    a_token,
                    a_vault,
                    a_depositor_ata,
                    a_vault_pda,
                    units_u64,
                    &signer_seeds,
                )?;
                events::redemptions_claimed(a_depositor.key, payout.underlying, payout.shares_burned);
            }
            Instruction::TransferShares { to, shares } => {
                accounts::expect_len(accounts, 2)?;
                let a_from = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_from)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                engine
                    .transfer_shares(&a_from.key.to_bytes(), &to.to_bytes(), shares as u128)
                    .map_err(map_fund_error)?;
                events::shares_transferred(a_from.key, &to, shares);
            }
            Instruction::MintProducts { orders } => {
                if orders.is_empty() {
                    return Err(ProgramError::InvalidInstructionData);
                }
                let batch_venue = orders[0].venue;
                if orders.iter().any(|o| o.venue != batch_venue) {
                    return Err(DecanterError::MixedVenueBatch.into());
                }

                accounts::expect_len(accounts, 8)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_escrow = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];
                let a_ix_sysvar = &accounts[7];

                accounts::expect_writable(a_slab)?;
                accounts::expect_writable(a_vault)?;
                accounts::expect_writable(a_escrow)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;
                let config = state::read_config(&data);

                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;
                let mint = Pubkey::new_from_array(config.collateral_mint);
                verify_vault(
                    a_vault,
                    &derived_pda,
                    &mint,
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;
                let (escrow_auth, _) =
                    accounts::derive_escrow_authority(program_id, a_slab.key, &batch_venue);
                verify_escrow(a_escrow, &escrow_auth, &mint)?;

                // One maker ATA per order after the fixed prefix (wrapped
                // funds carry the wrapper state account first).
                let maker_atas_base = if config.collateral_kind == COLLATERAL_WRAPPED {
                    9
                } else {
                    8
                };
                accounts::expect_len(accounts, maker_atas_base + orders.len())?;
                let adapter = load_adapter(&config, accounts.get(8))?;

                let clock = Clock::from_account_info(a_clock)?;
                let now = clock.unix_timestamp;

                #[cfg(not(test))]
                let verifier = sigverify::Ed25519Introspection { sysvar: a_ix_sysvar };
                #[cfg(test)]
                let verifier = {
                    let _ = a_ix_sysvar;
                    sigverify::StaticVerifier
                };

                let engine = zc::engine_mut(&mut data)?;

                let mut committed_total: u128 = 0;
                let mut legs: Vec<(u64, u64)> = Vec::with_capacity(orders.len());
                for order in orders.iter() {
                    let digest = sigverify::order_digest(program_id, a_slab.key, order);
                    if !verifier.verify(&order.maker.to_bytes(), &digest, &order.signature) {
                        return Err(DecanterError::InvalidMakerSignature.into());
                    }
                    let terms = order_terms(order);
                    let fund_units = engine
                        .originate(&terms, &digest, now, &adapter)
                        .map_err(map_fund_error)?;
                    let fund_units_u64: u64 = fund_units
                        .try_into()
                        .map_err(|_| ProgramError::from(DecanterError::FundOverflow))?;
                    let maker_units: u64 = adapter
                        .to_units(order.maker_collateral as u128)
                        .map_err(map_fund_error)?
                        .try_into()
                        .map_err(|_| ProgramError::from(DecanterError::FundOverflow))?;
                    committed_total = committed_total
                        .saturating_add(terms.fund_collateral().map_err(map_fund_error)?);
                    legs.push((fund_units_u64, maker_units));
                }

                let seed1: &[u8] = b"vault";
                let seed2: &[u8] = a_slab.key.as_ref();
                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seed3: &[u8] = &bump_arr;
                let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                for (i, (fund_units, maker_units)) in legs.iter().enumerate() {
                    // Fund leg: vault -> escrow, vault PDA signs
                    collateral::withdraw(
                        a_token,
                        a_vault,
                        a_escrow,
                        a_vault_pda,
                        *fund_units,
                        &signer_seeds,
                    )?;
                    // Maker leg: maker ATA -> escrow; the maker pre-approved
                    // the vault PDA as delegate when signing the order
                    let a_maker_ata = &accounts[maker_atas_base + i];
                    collateral::withdraw(
                        a_token,
                        a_maker_ata,
                        a_escrow,
                        a_vault_pda,
                        *maker_units,
                        &signer_seeds,
                    )?;
                }
                events::products_minted(&batch_venue, orders.len(), committed_total);
            }
            Instruction::BurnProducts { requests } => {
                if requests.is_empty() {
                    return Err(ProgramError::InvalidInstructionData);
                }
                let batch_venue = requests[0].venue;
                if requests.iter().any(|r| r.venue != batch_venue) {
                    return Err(DecanterError::MixedVenueBatch.into());
                }

                accounts::expect_len(accounts, 9)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_escrow = &accounts[3];
                let a_escrow_pda = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];
                let a_oracle = &accounts[7];
                let a_payout = &accounts[8];

                accounts::expect_writable(a_slab)?;
                accounts::expect_writable(a_vault)?;
                accounts::expect_writable(a_escrow)?;
                accounts::expect_writable(a_payout)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;
                let config = state::read_config(&data);

                accounts::expect_key(a_oracle, &Pubkey::new_from_array(config.settlement_oracle))?;

                let (vault_auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                let mint = Pubkey::new_from_array(config.collateral_mint);
                verify_vault(
                    a_vault,
                    &vault_auth,
                    &mint,
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;
                let (escrow_auth, escrow_bump) =
                    accounts::derive_escrow_authority(program_id, a_slab.key, &batch_venue);
                accounts::expect_key(a_escrow_pda, &escrow_auth)?;
                verify_escrow(a_escrow, &escrow_auth, &mint)?;
                verify_payout_ata(a_payout, &batch_venue, &mint)?;

                let settlements_base = if config.collateral_kind == COLLATERAL_WRAPPED {
                    10
                } else {
                    9
                };
                accounts::expect_len(accounts, settlements_base + requests.len())?;
                let adapter = load_adapter(&config, accounts.get(9))?;

                let clock = Clock::from_account_info(a_clock)?;
                let now = clock.unix_timestamp;

                // Resolve each request against the oracle fixing and the
                // venue's settlement account before touching the ledger.
                let mut resolved: Vec<SettleRequest> = Vec::with_capacity(requests.len());
                for (i, req) in requests.iter().enumerate() {
                    let settled_price = oracle::read_settled_price(a_oracle, req.expiry)?;
                    let payoff_e6 = venue::read_payoff_e6(
                        &accounts[settlements_base + i],
                        &req.venue,
                        req.expiry,
                        req.anchor_low,
                        req.anchor_high,
                        req.risk_bps,
                        settled_price,
                    )?;
                    resolved.push(SettleRequest {
                        key: settle_key(req),
                        payoff_e6,
                    });
                }

                let engine = zc::engine_mut(&mut data)?;
                let outcome = engine
                    .settle_batch(&resolved, now, &adapter)
                    .map_err(map_fund_error)?;

                let returned_u64: u64 = outcome
                    .returned_units
                    .try_into()
                    .map_err(|_| ProgramError::from(DecanterError::FundOverflow))?;
                let remainder_u64: u64 = outcome
                    .remainder_units
                    .try_into()
                    .map_err(|_| ProgramError::from(DecanterError::FundOverflow))?;

                let seed1: &[u8] = b"escrow";
                let seed2: &[u8] = a_slab.key.as_ref();
                let seed3: &[u8] = batch_venue.as_ref();
                let bump_arr: [u8; 1] = [escrow_bump];
                let seed4: &[u8] = &bump_arr;
                let seeds: [&[u8]; 4] = [seed1, seed2, seed3, seed4];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                collateral::withdraw(
                    a_token,
                    a_escrow,
                    a_vault,
                    a_escrow_pda,
                    returned_u64,
                    &signer_seeds,
                )?;
                // Maker-side remainder goes to the venue's payout account;
                // distribution back to individual makers is the venue's job.
                if remainder_u64 > 0 {
                    collateral::withdraw(
                        a_token,
                        a_escrow,
                        a_payout,
                        a_escrow_pda,
                        remainder_u64,
                        &signer_seeds,
                    )?;
                }
                events::products_burned(&batch_venue, requests.len(), outcome.returned_underlying);
            }
            Instruction::Harvest => {
                accounts::expect_len(accounts, 6)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_recipient_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;
                let mint = Pubkey::new_from_array(config.collateral_mint);
                verify_vault(
                    a_vault,
                    &derived_pda,
                    &mint,
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;
                verify_recipient_ata(
                    a_recipient_ata,
                    &Pubkey::new_from_array(config.fee_recipient),
                    &mint,
                )?;

                let adapter = load_adapter(&config, accounts.get(6))?;
                let engine = zc::engine_mut(&mut data)?;
                let (fee_underlying, fee_units) =
                    engine.harvest(&adapter).map_err(map_fund_error)?;

                let fee_u64: u64 = fee_units
                    .try_into()
                    .map_err(|_| ProgramError::from(DecanterError::FundOverflow))?;

                let seed1: &[u8] = b"vault";
                let seed2: &[u8] = a_slab.key.as_ref();
                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seed3: &[u8] = &bump_arr;
                let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                collateral::withdraw(
                    a_token,
                    a_vault,
                    a_recipient_ata,
                    a_vault_pda,
                    fee_u64,
                    &signer_seeds,
                )?;
                events::fee_collected(
                    &Pubkey::new_from_array(config.fee_recipient),
                    fee_underlying,
                );
            }
            Instruction::CollectProtocolFee => {
                accounts::expect_len(accounts, 6)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_treasury_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;
                let mint = Pubkey::new_from_array(config.collateral_mint);
                verify_vault(
                    a_vault,
                    &derived_pda,
                    &mint,
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;
                verify_recipient_ata(
                    a_treasury_ata,
                    &Pubkey::new_from_array(config.protocol_treasury),
                    &mint,
                )?;

                let adapter = load_adapter(&config, accounts.get(6))?;
                let engine = zc::engine_mut(&mut data)?;
                let (fee_underlying, fee_units) = engine
                    .collect_protocol_fee(&adapter)
                    .map_err(map_fund_error)?;

                let fee_u64: u64 = fee_units
                    .try_into()
                    .map_err(|_| ProgramError::from(DecanterError::FundOverflow))?;

                let seed1: &[u8] = b"vault";
                let seed2: &[u8] = a_slab.key.as_ref();
                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seed3: &[u8] = &bump_arr;
                let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                collateral::withdraw(
                    a_token,
                    a_vault,
                    a_treasury_ata,
                    a_vault_pda,
                    fee_u64,
                    &signer_seeds,
                )?;
                events::protocol_fee_collected(
                    &Pubkey::new_from_array(config.protocol_treasury),
                    fee_underlying,
                );
            }
        }
        Ok(())
    }

    fn verify_payout_ata(
        ai: &AccountInfo,
        expected_venue: &Pubkey,
        expected_mint: &Pubkey,
    ) -> Result<(), ProgramError> {
        if ai.owner != &spl_token::ID {
            return Err(DecanterError::InvalidPayoutAta.into());
        }
        if ai.data_len() != spl_token::state::Account::LEN {
            return Err(DecanterError::InvalidPayoutAta.into());
        }
        let data = ai.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(DecanterError::InvalidMint.into());
        }
        if tok.owner != *expected_venue {
            return Err(DecanterError::InvalidPayoutAta.into());
        }
        Ok(())
    }

    fn verify_recipient_ata(
        ai: &AccountInfo,
        expected_owner: &Pubkey,
        expected_mint: &Pubkey,
    ) -> Result<(), ProgramError> {
        if ai.owner != &spl_token::ID {
            return Err(DecanterError::InvalidVaultAta.into());
        }
        if ai.data_len() != spl_token::state::Account::LEN {
            return Err(DecanterError::InvalidVaultAta.into());
        }
        let data = ai.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(DecanterError::InvalidMint.into());
        }
        if tok.owner != *expected_owner {
            return Err(DecanterError::InvalidVaultAta.into());
        }
        Ok(())
    }
}

// 13. mod entrypoint
pub mod entrypoint {
    use crate::processor;
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult, pubkey::Pubkey,
    };

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        processor::process_instruction(program_id, accounts, instruction_data)
    }
}
