//! Pooled-fund accounting and settlement engine.
//!
//! This module is the platform-free core of the fund: share-based deposit
//! accounting, the signed-order position ledger, NAV computation while
//! collateral is committed to unsettled trades, the time-locked single-slot
//! redemption queue, and settlement-time fee accrual.
//!
//! Invariants maintained across every operation:
//! 1. `total_assets = to_underlying(idle_units) + total_committed`; origination
//!    and settlement only move value between the idle and committed buckets
//!    (plus the externally realized settlement delta).
//! 2. `total_assets - total_fee - total_protocol_fee` backs `total_shares`
//!    at the current price per share.
//! 3. Fees accrue from realized gains only; a loss or break-even settlement
//!    never changes `total_fee`.
//! 4. A consumed order digest can never originate a second position.
//!
//! All state lives in one fixed-size `repr(C)` slab suitable for a single
//! program account. No allocation, no platform types, checked arithmetic
//! everywhere a caller-visible amount is derived.

use core::mem::size_of;

// ============================================================================
// Capacities & Scales
// ============================================================================

/// Maximum depositor rows in the slab.
pub const MAX_DEPOSITORS: usize = 64;

/// Maximum simultaneously outstanding position keys.
pub const MAX_POSITIONS: usize = 64;

/// Maximum consumed order digests remembered for replay protection.
/// Digests are never recycled; a fund that exhausts this table can settle
/// and redeem but cannot originate further trades.
pub const MAX_CONSUMED_ORDERS: usize = 256;

/// Registry capacity for maker signers and venues.
pub const MAX_MAKERS: usize = 8;
pub const MAX_VENUES: usize = 8;

/// Price-per-share fixed point: 1.0 == 1_000_000 (e6).
pub const PPS_ONE: u128 = 1_000_000;

/// Basis-point denominator for fee rates.
pub const BPS_DENOM: u128 = 10_000;

/// Shares minted to a dead slot on the first deposit and excluded from the
/// depositor's credited balance. Floors the share supply so a first depositor
/// cannot manipulate price-per-share with a donation.
pub const DEAD_SHARES: u128 = 1_000;

/// Default redemption lock: 7 days.
pub const DEFAULT_LOCK_SECS: i64 = 7 * 24 * 60 * 60;

/// Default claim window after the lock elapses: 2 days.
pub const DEFAULT_GRACE_SECS: i64 = 2 * 24 * 60 * 60;

// ============================================================================
// BPF-Safe 128-bit Storage
// ============================================================================

/// `u128` stored as `[u64; 2]` to keep 8-byte alignment in the on-chain slab.
/// Rust 1.77+ aligns `u128` to 16 on x86_64 while SBF keeps 8; storing raw
/// `u128` in a `repr(C)` slab would make host and on-chain layouts diverge.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct U128([u64; 2]);

impl U128 {
    pub const ZERO: Self = Self::new(0);

    #[inline(always)]
    pub const fn new(val: u128) -> Self {
        Self([val as u64, (val >> 64) as u64])
    }

    #[inline(always)]
    pub const fn get(self) -> u128 {
        (self.0[0] as u128) | ((self.0[1] as u128) << 64)
    }

    #[inline(always)]
    pub fn set(&mut self, val: u128) {
        *self = Self::new(val);
    }

    #[inline(always)]
    pub fn is_zero(self) -> bool {
        self.0[0] == 0 && self.0[1] == 0
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FundError {
    /// Zero-amount deposit, withdrawal or transfer
    ZeroAmount,

    /// First deposit too small to cover the dead-share floor
    AmountTooSmall,

    /// Requested shares exceed the free (non-pending) balance
    InsufficientShares,

    /// Idle collateral cannot cover the requested commitment
    InsufficientCollateral,

    /// Idle collateral cannot cover a redemption claim or fee harvest
    InsufficientCollateralToRedeem,

    /// A prior redemption request is still inside its claim window
    RedemptionAlreadyPending,

    /// Claim with no pending redemption recorded
    NoPendingRedemption,

    /// Claim attempted outside the `[t0+lock, t0+lock+grace]` window
    RedemptionLocked,

    /// Transfer would dip into the reserved pending-redemption amount
    InvalidTransferAmount,

    /// Order deadline has passed (or expiry is not in the future)
    OrderExpired,

    /// Order digest was already used to originate a position
    OrderAlreadyConsumed,

    /// Maker signer is not whitelisted
    MakerNotEnabled,

    /// Venue is not whitelisted
    VenueNotEnabled,

    /// Order terms are internally inconsistent
    InvalidOrder,

    /// No outstanding position for the settlement key (or already settled)
    PositionNotFound,

    /// Settlement attempted before the position's expiry
    PositionNotExpired,

    /// Reported payoff would pay out more than the position's collateral
    PayoffExceedsCollateral,

    /// Harvest with nothing accrued
    ZeroFee,

    /// Depositor identity not present in the slab
    AccountNotFound,

    /// Fixed table capacity exhausted
    DepositorTableFull,
    PositionTableFull,
    OrderTableFull,
    RegistryFull,

    /// Arithmetic overflow or division by zero
    Overflow,
}

pub type Result<T> = core::result::Result<T, FundError>;

// ============================================================================
// Checked Math Helpers
// ============================================================================

#[inline]
fn add(a: u128, b: u128) -> Result<u128> {
    a.checked_add(b).ok_or(FundError::Overflow)
}

#[inline]
fn sub(a: u128, b: u128) -> Result<u128> {
    a.checked_sub(b).ok_or(FundError::Overflow)
}

/// floor(a * b / den)
#[inline]
fn mul_div(a: u128, b: u128, den: u128) -> Result<u128> {
    if den == 0 {
        return Err(FundError::Overflow);
    }
    Ok(a.checked_mul(b).ok_or(FundError::Overflow)? / den)
}

/// floor(amount * rate_bps / 10_000)
#[inline]
fn bps(amount: u128, rate_bps: u64) -> Result<u128> {
    mul_div(amount, rate_bps as u128, BPS_DENOM)
}

// ============================================================================
// Collateral Adapter (plain vs yield-wrapped variants)
// ============================================================================

/// Conversion capability between vault units (what the fund's token account
/// actually holds) and the underlying collateral asset (what every price,
/// fee and committed amount is denominated in).
///
/// For plain-collateral funds the two are identical. For wrapped funds the
/// vault holds interest-bearing wrapper shares and the wrapper's exchange
/// rate is read at entry and treated as authoritative.
pub trait CollateralAdapter {
    fn to_underlying(&self, units: u128) -> Result<u128>;
    fn to_units(&self, underlying: u128) -> Result<u128>;
}

/// Adapter selected from the fund's configuration at the top of every
/// state-changing operation.
#[derive(Clone, Copy, Debug)]
pub enum CollateralSource {
    /// Vault units are the underlying asset.
    Plain,
    /// Vault units are wrapper shares; `rate_e6` underlying per share.
    Wrapped { rate_e6: u64 },
}

impl CollateralAdapter for CollateralSource {
    #[inline]
    fn to_underlying(&self, units: u128) -> Result<u128> {
        match self {
            CollateralSource::Plain => Ok(units),
            CollateralSource::Wrapped { rate_e6 } => mul_div(units, *rate_e6 as u128, PPS_ONE),
        }
    }

    #[inline]
    fn to_units(&self, underlying: u128) -> Result<u128> {
        match self {
            CollateralSource::Plain => Ok(underlying),
            CollateralSource::Wrapped { rate_e6 } => {
                if *rate_e6 == 0 {
                    return Err(FundError::Overflow);
                }
                mul_div(underlying, PPS_ONE, *rate_e6 as u128)
            }
        }
    }
}

// ============================================================================
// Core Data Structures
// ============================================================================

/// Fund parameters fixed at initialization.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FundParams {
    /// Performance fee on realized gains, basis points
    pub fee_rate_bps: u64,

    /// Protocol fee rate, basis points
    pub protocol_fee_rate_bps: u64,

    /// 1: protocol fee accrues from gains at settlement time.
    /// 0: protocol fee is carved out of the performance fee at harvest time.
    pub protocol_fee_at_settlement: u8,
    pub _padding: [u8; 7],

    /// Seconds a redemption request stays locked before it can be claimed
    pub redemption_lock_secs: i64,

    /// Seconds the claim window stays open once the lock elapses
    pub redemption_grace_secs: i64,
}

impl FundParams {
    pub fn validate(&self) -> Result<()> {
        let combined = (self.fee_rate_bps as u128).saturating_add(self.protocol_fee_rate_bps as u128);
        if combined > BPS_DENOM {
            return Err(FundError::InvalidOrder);
        }
        if self.redemption_lock_secs <= 0 || self.redemption_grace_secs <= 0 {
            return Err(FundError::InvalidOrder);
        }
        Ok(())
    }
}

/// Per-depositor row: share balance plus the single-slot redemption queue.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Depositor {
    /// Owner pubkey (signature checks done by the wrapper)
    pub owner: [u8; 32],

    /// Share balance, inclusive of any queued (pending) shares
    pub shares: U128,

    /// Shares queued for redemption; reserved, not transferable
    pub pending_shares: U128,

    /// Timestamp of the pending redemption request (t0)
    pub pending_since: i64,

    pub used: u8,
    pub _padding: [u8; 7],
}

impl Depositor {
    const EMPTY: Self = Self {
        owner: [0; 32],
        shares: U128::ZERO,
        pending_shares: U128::ZERO,
        pending_since: 0,
        used: 0,
        _padding: [0; 7],
    };
}

/// Outstanding committed collateral, aggregated per position key.
/// Multiple maker orders sharing `(venue, expiry, anchors, risk)` fold into
/// one row; the row is zeroed when settled, so a second settlement of the
/// same key cannot release collateral twice.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    pub venue: [u8; 32],
    pub expiry: i64,
    pub anchor_prices: [u64; 2],
    pub risk_bps: u64,

    /// Fund-side collateral committed into this key (underlying)
    pub collateral: U128,

    /// Total collateral at the venue for this key, maker legs included;
    /// the cap on what settlement can return to the fund
    pub gross_collateral: U128,

    pub used: u8,
    pub _padding: [u8; 7],
}

impl Position {
    const EMPTY: Self = Self {
        venue: [0; 32],
        expiry: 0,
        anchor_prices: [0; 2],
        risk_bps: 0,
        collateral: U128::ZERO,
        gross_collateral: U128::ZERO,
        used: 0,
        _padding: [0; 7],
    };

    #[inline]
    fn matches(&self, key: &PositionKey) -> bool {
        self.used == 1
            && self.venue == key.venue
            && self.expiry == key.expiry
            && self.anchor_prices == key.anchor_prices
            && self.risk_bps == key.risk_bps
    }
}

/// Lookup key for the position ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PositionKey {
    pub venue: [u8; 32],
    pub expiry: i64,
    pub anchor_prices: [u64; 2],
    pub risk_bps: u64,
}

/// Economic terms of a maker-signed order. Signature bytes and the canonical
/// digest are the wrapper's business; the engine sees terms plus digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderTerms {
    pub venue: [u8; 32],
    pub maker: [u8; 32],
    /// Total collateral at the venue for this order (underlying)
    pub gross_collateral: u128,
    /// Maker's leg of `gross_collateral`; the fund commits the remainder
    pub maker_collateral: u128,
    pub expiry: i64,
    pub anchor_prices: [u64; 2],
    pub risk_bps: u64,
    pub deadline: i64,
}

impl OrderTerms {
    #[inline]
    pub fn key(&self) -> PositionKey {
        PositionKey {
            venue: self.venue,
            expiry: self.expiry,
            anchor_prices: self.anchor_prices,
            risk_bps: self.risk_bps,
        }
    }

    /// Fund-side leg: gross minus the maker's collateral.
    #[inline]
    pub fn fund_collateral(&self) -> Result<u128> {
        self.gross_collateral
            .checked_sub(self.maker_collateral)
            .ok_or(FundError::InvalidOrder)
    }
}

/// One settlement request: position key plus the venue-resolved payoff.
/// `payoff_e6` is the fraction of the key's gross collateral returned to the
/// fund (minter side), e6 fixed point, at most `PPS_ONE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettleRequest {
    pub key: PositionKey,
    pub payoff_e6: u64,
}

/// Amounts produced by a settlement batch, for the wrapper's token legs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SettleOutcome {
    /// Underlying returned to the fund across the batch
    pub returned_underlying: u128,
    /// Same, in vault units (escrow -> vault transfer amount)
    pub returned_units: u128,
    /// Sum of positive realized deltas
    pub realized_gain: u128,
    /// Sum of negative realized deltas (absolute)
    pub realized_loss: u128,
    /// Performance fee accrued by this batch
    pub fee_accrued: u128,
    /// Protocol fee accrued by this batch (settlement-split funds only)
    pub protocol_fee_accrued: u128,
    /// Maker-side remainder across the batch (gross minus returned)
    pub remainder_underlying: u128,
    /// Same, in vault units (escrow -> venue payout transfer amount)
    pub remainder_units: u128,
}

/// Payout produced by a successful redemption claim.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedemptionPayout {
    pub underlying: u128,
    /// Vault units to transfer out
    pub units: u128,
    pub shares_burned: u128,
}

// ============================================================================
// Fund Engine
// ============================================================================

/// The fund's entire mutable ledger. One instance per fund, living inside the
/// program's slab account; every state-changing operation goes through a
/// method on this struct and nothing else mutates it.
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundEngine {
    pub params: FundParams,

    /// Shares outstanding, dead shares included
    pub total_shares: U128,

    /// Shares minted to the dead slot on first deposit (never redeemable)
    pub dead_shares: U128,

    /// Idle collateral held by the vault, in adapter units
    pub idle_units: U128,

    /// Collateral committed to outstanding positions (underlying)
    pub total_committed: U128,

    /// Accrued performance fee, not yet harvested (underlying)
    pub total_fee: U128,

    /// Accrued protocol fee, not yet collected (underlying)
    pub total_protocol_fee: U128,

    /// Sum of all depositors' pending redemption shares
    pub pending_shares_total: U128,

    // ========================================
    // Lifetime Counters (telemetry)
    // ========================================
    pub lifetime_originations: u64,
    pub lifetime_settlements: u64,

    // ========================================
    // Registry (maker signers / venues the fund accepts)
    // ========================================
    pub makers: [[u8; 32]; MAX_MAKERS],
    pub maker_enabled: [u8; MAX_MAKERS],
    pub venues: [[u8; 32]; MAX_VENUES],
    pub venue_enabled: [u8; MAX_VENUES],

    // ========================================
    // Tables
    // ========================================
    pub num_consumed: u16,
    pub _padding: [u8; 6],

    pub depositors: [Depositor; MAX_DEPOSITORS],
    pub positions: [Position; MAX_POSITIONS],

    /// Consumed order digests (full signed-payload hashes)
    pub consumed: [[u8; 32]; MAX_CONSUMED_ORDERS],
}

impl FundEngine {
    /// Create a new engine (stack-allocates the full struct - avoid in BPF!)
    ///
    /// On-chain, use `init_in_place` on zeroed slab memory instead.
    pub fn new(params: FundParams) -> Self {
        Self {
            params,
            total_shares: U128::ZERO,
            dead_shares: U128::ZERO,
            idle_units: U128::ZERO,
            total_committed: U128::ZERO,
            total_fee: U128::ZERO,
            total_protocol_fee: U128::ZERO,
            pending_shares_total: U128::ZERO,
            lifetime_originations: 0,
            lifetime_settlements: 0,
            makers: [[0; 32]; MAX_MAKERS],
            maker_enabled: [0; MAX_MAKERS],
            venues: [[0; 32]; MAX_VENUES],
            venue_enabled: [0; MAX_VENUES],
            num_consumed: 0,
            _padding: [0; 6],
            depositors: [Depositor::EMPTY; MAX_DEPOSITORS],
            positions: [Position::EMPTY; MAX_POSITIONS],
            consumed: [[0; 32]; MAX_CONSUMED_ORDERS],
        }
    }

    /// Initialize in place (zero-copy friendly).
    ///
    /// PREREQUISITE: the memory backing `self` MUST already be zeroed.
    /// Only non-zero fields are touched; zero is the correct initial value
    /// for every counter, table row and registry slot.
    pub fn init_in_place(&mut self, params: FundParams) {
        self.params = params;
    }

    pub const fn size() -> usize {
        size_of::<Self>()
    }

    // ========================================
    // Registry
    // ========================================

    /// Whitelist or disable a maker signer.
    pub fn set_maker(&mut self, maker: [u8; 32], enabled: bool) -> Result<()> {
        Self::registry_set(&mut self.makers, &mut self.maker_enabled, maker, enabled)
    }

    /// Whitelist or disable a venue.
    pub fn set_venue(&mut self, venue: [u8; 32], enabled: bool) -> Result<()> {
        Self::registry_set(&mut self.venues, &mut self.venue_enabled, venue, enabled)
    }

    pub fn is_enabled_maker(&self, maker: &[u8; 32]) -> bool {
        Self::registry_get(&self.makers, &self.maker_enabled, maker)
    }

    pub fn is_enabled_venue(&self, venue: &[u8; 32]) -> bool {
        Self::registry_get(&self.venues, &self.venue_enabled, venue)
    }

    fn registry_set(
        keys: &mut [[u8; 32]],
        flags: &mut [u8],
        key: [u8; 32],
        enabled: bool,
    ) -> Result<()> {
        // Existing entry: toggle in place
        for i in 0..keys.len() {
            if keys[i] == key && flags[i] != 0 {
                flags[i] = enabled as u8;
                return Ok(());
            }
        }
        if !enabled {
            return Ok(()); // disabling an unknown key is a no-op
        }
        for i in 0..keys.len() {
            if flags[i] == 0 {
                keys[i] = key;
                flags[i] = 1;
                return Ok(());
            }
        }
        Err(FundError::RegistryFull)
    }

    fn registry_get(keys: &[[u8; 32]], flags: &[u8], key: &[u8; 32]) -> bool {
        for i in 0..keys.len() {
            if flags[i] != 0 && keys[i] == *key {
                return true;
            }
        }
        false
    }

    // ========================================
    // Depositor Table
    // ========================================

    pub fn find_depositor(&self, owner: &[u8; 32]) -> Option<usize> {
        self.depositors
            .iter()
            .position(|d| d.used == 1 && d.owner == *owner)
    }

    fn find_or_alloc_depositor(&mut self, owner: &[u8; 32]) -> Result<usize> {
        if let Some(idx) = self.find_depositor(owner) {
            return Ok(idx);
        }
        for (idx, d) in self.depositors.iter_mut().enumerate() {
            if d.used == 0 {
                *d = Depositor::EMPTY;
                d.owner = *owner;
                d.used = 1;
                return Ok(idx);
            }
        }
        Err(FundError::DepositorTableFull)
    }

    pub fn shares_of(&self, owner: &[u8; 32]) -> u128 {
        self.find_depositor(owner)
            .map(|i| self.depositors[i].shares.get())
            .unwrap_or(0)
    }

    /// `(pending_shares, requested_at)` for the depositor's redemption slot.
    pub fn redemption_of(&self, owner: &[u8; 32]) -> (u128, i64) {
        match self.find_depositor(owner) {
            Some(i) => (
                self.depositors[i].pending_shares.get(),
                self.depositors[i].pending_since,
            ),
            None => (0, 0),
        }
    }

    // ========================================
    // NAV Accountant
    // ========================================

    /// Idle plus committed collateral, in underlying.
    pub fn total_assets(&self, adapter: &impl CollateralAdapter) -> Result<u128> {
        add(
            adapter.to_underlying(self.idle_units.get())?,
            self.total_committed.get(),
        )
    }

    /// Assets net of accrued fees: the collateral actually backing shares.
    pub fn total_collateral(&self, adapter: &impl CollateralAdapter) -> Result<u128> {
        let assets = self.total_assets(adapter)?;
        let fees = add(self.total_fee.get(), self.total_protocol_fee.get())?;
        sub(assets, fees)
    }

    /// Price per share in e6 fixed point; 1.0 when no shares exist.
    pub fn price_per_share_e6(&self, adapter: &impl CollateralAdapter) -> Result<u128> {
        let shares = self.total_shares.get();
        if shares == 0 {
            return Ok(PPS_ONE);
        }
        mul_div(self.total_collateral(adapter)?, PPS_ONE, shares)
    }

    /// Net collateral backing shares that are not queued for redemption.
    pub fn unredeemed_collateral(&self, adapter: &impl CollateralAdapter) -> Result<u128> {
        let net = self.total_collateral(adapter)?;
        let pps = self.price_per_share_e6(adapter)?;
        let queued = mul_div(self.pending_shares_total.get(), pps, PPS_ONE)?;
        Ok(net.saturating_sub(queued))
    }

    /// Mint shares for a deposit of `amount_units` vault units.
    ///
    /// Priced at the pre-deposit share price so the depositor cannot be
    /// diluted by their own deposit. Returns the shares credited to the
    /// depositor (first deposit: dead-share floor already carved out).
    pub fn deposit(
        &mut self,
        owner: &[u8; 32],
        amount_units: u128,
        adapter: &impl CollateralAdapter,
    ) -> Result<u128> {
        let underlying = adapter.to_underlying(amount_units)?;
        if underlying == 0 {
            return Err(FundError::ZeroAmount);
        }

        let pps = self.price_per_share_e6(adapter)?;
        if pps == 0 {
            return Err(FundError::Overflow);
        }
        let minted = mul_div(underlying, PPS_ONE, pps)?;

        let credited = if self.total_shares.is_zero() {
            if minted <= DEAD_SHARES {
                return Err(FundError::AmountTooSmall);
            }
            self.dead_shares.set(add(self.dead_shares.get(), DEAD_SHARES)?);
            sub(minted, DEAD_SHARES)?
        } else {
            if minted == 0 {
                return Err(FundError::AmountTooSmall);
            }
            minted
        };

        let idx = self.find_or_alloc_depositor(owner)?;
        self.total_shares.set(add(self.total_shares.get(), minted)?);
        self.idle_units.set(add(self.idle_units.get(), amount_units)?);
        let d = &mut self.depositors[idx];
        d.shares.set(add(d.shares.get(), credited)?);
        Ok(credited)
    }

    // ========================================
    // Redemption Queue
    // ========================================

    /// Queue `shares` for delayed withdrawal. Moves no funds; payout happens
    /// at claim time at the then-current share price.
    pub fn request_redemption(&mut self, owner: &[u8; 32], shares: u128, now: i64) -> Result<()> {
        if shares == 0 {
            return Err(FundError::ZeroAmount);
        }
        let idx = self.find_depositor(owner).ok_or(FundError::AccountNotFound)?;
        let lock = self.params.redemption_lock_secs;
        let grace = self.params.redemption_grace_secs;

        let d = &mut self.depositors[idx];
        let pending = d.pending_shares.get();
        if pending > 0 {
            let window_end = d
                .pending_since
                .saturating_add(lock)
                .saturating_add(grace);
            if now <= window_end {
                return Err(FundError::RedemptionAlreadyPending);
            }
            // Expired unclaimed request: silently replaced
            self.pending_shares_total
                .set(sub(self.pending_shares_total.get(), pending)?);
            d.pending_shares = U128::ZERO;
        }

        let free = sub(d.shares.get(), d.pending_shares.get())?;
        if shares > free {
            return Err(FundError::InsufficientShares);
        }

        d.pending_shares.set(shares);
        d.pending_since = now;
        self.pending_shares_total
            .set(add(self.pending_shares_total.get(), shares)?);
        Ok(())
    }

    /// Claim a matured redemption at the claim-time share price.
    pub fn claim_redemptions(
        &mut self,
        owner: &[u8; 32],
        now: i64,
        adapter: &impl CollateralAdapter,
    ) -> Result<RedemptionPayout> {
        let idx = self.find_depositor(owner).ok_or(FundError::AccountNotFound)?;
        let pending = self.depositors[idx].pending_shares.get();
        if pending == 0 {
            return Err(FundError::NoPendingRedemption);
        }

        let t0 = self.depositors[idx].pending_since;
        let opens = t0.saturating_add(self.params.redemption_lock_secs);
        let closes = opens.saturating_add(self.params.redemption_grace_secs);
        if now < opens || now > closes {
            return Err(FundError::RedemptionLocked);
        }

        let pps = self.price_per_share_e6(adapter)?;
        let underlying = mul_div(pending, pps, PPS_ONE)?;
        let units = adapter.to_units(underlying)?;
        if units > self.idle_units.get() {
            return Err(FundError::InsufficientCollateralToRedeem);
        }

        self.idle_units.set(sub(self.idle_units.get(), units)?);
        self.total_shares.set(sub(self.total_shares.get(), pending)?);
        self.pending_shares_total
            .set(sub(self.pending_shares_total.get(), pending)?);
        let d = &mut self.depositors[idx];
        d.shares.set(sub(d.shares.get(), pending)?);
        d.pending_shares = U128::ZERO;
        d.pending_since = 0;
        if d.shares.is_zero() {
            // Full exit: release the table row
            *d = Depositor::EMPTY;
        }

        Ok(RedemptionPayout {
            underlying,
            units,
            shares_burned: pending,
        })
    }

    /// Move shares between depositors. Shares queued for redemption are
    /// reserved: the sender can only spend `balance - pending`.
    pub fn transfer_shares(
        &mut self,
        from: &[u8; 32],
        to: &[u8; 32],
        shares: u128,
    ) -> Result<()> {
        if shares == 0 {
            return Err(FundError::ZeroAmount);
        }
        let from_idx = self.find_depositor(from).ok_or(FundError::AccountNotFound)?;
        let free = sub(
            self.depositors[from_idx].shares.get(),
            self.depositors[from_idx].pending_shares.get(),
        )?;
        if shares > free {
            return Err(FundError::InvalidTransferAmount);
        }
        let to_idx = self.find_or_alloc_depositor(to)?;

        let from_d = &mut self.depositors[from_idx];
        from_d.shares.set(sub(from_d.shares.get(), shares)?);
        let to_d = &mut self.depositors[to_idx];
        to_d.shares.set(add(to_d.shares.get(), shares)?);
        // A fully drained sender with nothing pending gives its row back.
        // A self-transfer lands back on the same row, which stays live.
        let from_d = &mut self.depositors[from_idx];
        if from_d.shares.is_zero() && from_d.pending_shares.is_zero() {
            *from_d = Depositor::EMPTY;
        }
        Ok(())
    }

    // ========================================
    // Signed-Order Origination (Position Ledger commit)
    // ========================================

    fn is_consumed(&self, digest: &[u8; 32]) -> bool {
        self.consumed[..self.num_consumed as usize]
            .iter()
            .any(|c| c == digest)
    }

    fn find_position(&self, key: &PositionKey) -> Option<usize> {
        self.positions.iter().position(|p| p.matches(key))
    }

    /// Commit the fund's leg of a verified maker order into the position
    /// ledger. `digest` is the canonical signed-payload hash; signature
    /// validity is the caller's responsibility, single-use is enforced here.
    ///
    /// Returns the vault units to move into the venue escrow for the fund leg.
    pub fn originate(
        &mut self,
        order: &OrderTerms,
        digest: &[u8; 32],
        now: i64,
        adapter: &impl CollateralAdapter,
    ) -> Result<u128> {
        if !self.is_enabled_venue(&order.venue) {
            return Err(FundError::VenueNotEnabled);
        }
        if !self.is_enabled_maker(&order.maker) {
            return Err(FundError::MakerNotEnabled);
        }
        if now > order.deadline {
            return Err(FundError::OrderExpired);
        }
        if order.expiry <= now {
            return Err(FundError::InvalidOrder);
        }
        let fund_leg = order.fund_collateral()?;
        if fund_leg == 0 {
            return Err(FundError::ZeroAmount);
        }
        if self.is_consumed(digest) {
            return Err(FundError::OrderAlreadyConsumed);
        }
        if (self.num_consumed as usize) >= MAX_CONSUMED_ORDERS {
            return Err(FundError::OrderTableFull);
        }

        let units = adapter.to_units(fund_leg)?;
        if units > self.idle_units.get() {
            return Err(FundError::InsufficientCollateral);
        }

        let key = order.key();
        let idx = match self.find_position(&key) {
            Some(idx) => idx,
            None => {
                let idx = self
                    .positions
                    .iter()
                    .position(|p| p.used == 0)
                    .ok_or(FundError::PositionTableFull)?;
                self.positions[idx] = Position {
                    venue: key.venue,
                    expiry: key.expiry,
                    anchor_prices: key.anchor_prices,
                    risk_bps: key.risk_bps,
                    collateral: U128::ZERO,
                    gross_collateral: U128::ZERO,
                    used: 1,
                    _padding: [0; 7],
                };
                idx
            }
        };

        // All checks passed: mutate
        self.idle_units.set(sub(self.idle_units.get(), units)?);
        self.total_committed
            .set(add(self.total_committed.get(), fund_leg)?);
        let p = &mut self.positions[idx];
        p.collateral.set(add(p.collateral.get(), fund_leg)?);
        p.gross_collateral
            .set(add(p.gross_collateral.get(), order.gross_collateral)?);
        self.consumed[self.num_consumed as usize] = *digest;
        self.num_consumed += 1;
        self.lifetime_originations = self.lifetime_originations.saturating_add(1);
        Ok(units)
    }

    /// Committed collateral outstanding for a key (0 once settled).
    pub fn committed_for(&self, key: &PositionKey) -> u128 {
        self.find_position(key)
            .map(|i| self.positions[i].collateral.get())
            .unwrap_or(0)
    }

    // ========================================
    // Settlement & Fee Engine
    // ========================================

    /// Settle a batch of expired positions against venue-resolved payoffs.
    ///
    /// Two-phase: every request is validated against the current ledger
    /// before anything mutates, so one bad entry fails the whole batch with
    /// no partial settlement.
    pub fn settle_batch(
        &mut self,
        requests: &[SettleRequest],
        now: i64,
        adapter: &impl CollateralAdapter,
    ) -> Result<SettleOutcome> {
        // Phase 1: validate
        for (i, req) in requests.iter().enumerate() {
            let idx = self
                .find_position(&req.key)
                .ok_or(FundError::PositionNotFound)?;
            if now < self.positions[idx].expiry {
                return Err(FundError::PositionNotExpired);
            }
            if (req.payoff_e6 as u128) > PPS_ONE {
                return Err(FundError::PayoffExceedsCollateral);
            }
            // A key may appear only once per batch; the second occurrence
            // would release already-released collateral.
            if requests[..i].iter().any(|prev| prev.key == req.key) {
                return Err(FundError::PositionNotFound);
            }
            // Dry-run the arithmetic so phase 2 cannot fail midway
            let gross = self.positions[idx].gross_collateral.get();
            let returned = mul_div(gross, req.payoff_e6 as u128, PPS_ONE)?;
            adapter.to_units(returned)?;
            adapter.to_units(sub(gross, returned)?)?;
        }

        // Phase 2: apply
        let mut out = SettleOutcome::default();
        for req in requests {
            let idx = self
                .find_position(&req.key)
                .ok_or(FundError::PositionNotFound)?;
            let committed = self.positions[idx].collateral.get();
            let gross = self.positions[idx].gross_collateral.get();
            self.positions[idx] = Position::EMPTY;

            let returned = mul_div(gross, req.payoff_e6 as u128, PPS_ONE)?;
            let units = adapter.to_units(returned)?;
            let remainder = sub(gross, returned)?;
            let remainder_units = adapter.to_units(remainder)?;

            self.total_committed
                .set(sub(self.total_committed.get(), committed)?);
            self.idle_units.set(add(self.idle_units.get(), units)?);

            if returned >= committed {
                let gain = returned - committed;
                let fee = bps(gain, self.params.fee_rate_bps)?;
                let protocol_fee = if self.params.protocol_fee_at_settlement == 1 {
                    bps(gain, self.params.protocol_fee_rate_bps)?
                } else {
                    0
                };
                self.total_fee.set(add(self.total_fee.get(), fee)?);
                self.total_protocol_fee
                    .set(add(self.total_protocol_fee.get(), protocol_fee)?);
                out.realized_gain = add(out.realized_gain, gain)?;
                out.fee_accrued = add(out.fee_accrued, fee)?;
                out.protocol_fee_accrued = add(out.protocol_fee_accrued, protocol_fee)?;
            } else {
                // Losses are never fee-bearing
                out.realized_loss = add(out.realized_loss, committed - returned)?;
            }

            out.returned_underlying = add(out.returned_underlying, returned)?;
            out.returned_units = add(out.returned_units, units)?;
            out.remainder_underlying = add(out.remainder_underlying, remainder)?;
            out.remainder_units = add(out.remainder_units, remainder_units)?;
            self.lifetime_settlements = self.lifetime_settlements.saturating_add(1);
        }
        Ok(out)
    }

    /// Harvest the accrued performance fee. For harvest-split funds the
    /// protocol cut is carved out here and left for `collect_protocol_fee`.
    ///
    /// Returns `(underlying, units)` to transfer to the fee recipient.
    pub fn harvest(&mut self, adapter: &impl CollateralAdapter) -> Result<(u128, u128)> {
        let accrued = self.total_fee.get();
        if accrued == 0 {
            return Err(FundError::ZeroFee);
        }
        let protocol_cut = if self.params.protocol_fee_at_settlement == 1 {
            0
        } else {
            bps(accrued, self.params.protocol_fee_rate_bps)?
        };
        let fee_out = sub(accrued, protocol_cut)?;
        if fee_out == 0 {
            return Err(FundError::ZeroFee);
        }
        let units = adapter.to_units(fee_out)?;
        if units > self.idle_units.get() {
            return Err(FundError::InsufficientCollateralToRedeem);
        }

        // No mutation before this point: an Err above must leave both
        // accrual counters exactly as they were.
        self.total_protocol_fee
            .set(add(self.total_protocol_fee.get(), protocol_cut)?);
        self.idle_units.set(sub(self.idle_units.get(), units)?);
        self.total_fee = U128::ZERO;
        Ok((fee_out, units))
    }

    /// Pay out the accrued protocol fee to the protocol treasury.
    pub fn collect_protocol_fee(
        &mut self,
        adapter: &impl CollateralAdapter,
    ) -> Result<(u128, u128)> {
        let accrued = self.total_protocol_fee.get();
        if accrued == 0 {
            return Err(FundError::ZeroFee);
        }
        let units = adapter.to_units(accrued)?;
        if units > self.idle_units.get() {
            return Err(FundError::InsufficientCollateralToRedeem);
        }
        self.idle_units.set(sub(self.idle_units.get(), units)?);
        self.total_protocol_fee = U128::ZERO;
        Ok((accrued, units))
    }

    // ========================================
    // Invariant Checking (tests / fuzz)
    // ========================================

    /// Structural conservation: table sums match the ledger aggregates and
    /// accrued fees never exceed assets.
    pub fn check_conservation(&self, adapter: &impl CollateralAdapter) -> bool {
        let mut share_sum = self.dead_shares.get();
        let mut pending_sum = 0u128;
        for d in self.depositors.iter().filter(|d| d.used == 1) {
            share_sum = share_sum.saturating_add(d.shares.get());
            pending_sum = pending_sum.saturating_add(d.pending_shares.get());
            if d.pending_shares.get() > d.shares.get() {
                return false;
            }
        }
        if share_sum != self.total_shares.get() {
            return false;
        }
        if pending_sum != self.pending_shares_total.get() {
            return false;
        }

        let mut committed_sum = 0u128;
        for p in self.positions.iter().filter(|p| p.used == 1) {
            committed_sum = committed_sum.saturating_add(p.collateral.get());
            if p.collateral.get() > p.gross_collateral.get() {
                return false;
            }
        }
        if committed_sum != self.total_committed.get() {
            return false;
        }

        let assets = match self.total_assets(adapter) {
            Ok(a) => a,
            Err(_) => return false,
        };
        let fees = self
            .total_fee
            .get()
            .saturating_add(self.total_protocol_fee.get());
        if self.total_shares.is_zero() && !self.total_committed.is_zero() {
            return false;
        }
        assets >= fees
    }
}
