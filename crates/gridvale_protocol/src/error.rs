//! Error taxonomy surfaced to clients.

use std::io::Write;

use crate::var_int::VarInt;
use crate::{Decode, Encode};

/// Broad classification of a command failure. Clients use the category to
/// decide presentation; the [`ErrorCode`] identifies the exact condition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ErrorCategory {
    Validation,
    RateLimit,
    Auth,
    Business,
    System,
}

impl ErrorCategory {
    const ALL: [ErrorCategory; 5] = [
        ErrorCategory::Validation,
        ErrorCategory::RateLimit,
        ErrorCategory::Auth,
        ErrorCategory::Business,
        ErrorCategory::System,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Business => "business",
            ErrorCategory::System => "system",
        }
    }
}

impl Encode for ErrorCategory {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        VarInt(*self as i32).encode(w)
    }
}

impl Decode<'_> for ErrorCategory {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let n = VarInt::decode(r)?.0;
        Self::ALL
            .get(n as usize)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("invalid error category tag {n}"))
    }
}

macro_rules! error_codes {
    ($($variant:ident = $name:literal => $category:ident),* $(,)?) => {
        /// Machine-readable failure codes carried by `RESP_ERROR`.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        pub enum ErrorCode {
            $($variant,)*
        }

        impl ErrorCode {
            const ALL: &'static [ErrorCode] = &[$(ErrorCode::$variant,)*];

            pub const fn name(self) -> &'static str {
                match self {
                    $(ErrorCode::$variant => $name,)*
                }
            }

            /// The category this code belongs to.
            pub const fn category(self) -> ErrorCategory {
                match self {
                    $(ErrorCode::$variant => ErrorCategory::$category,)*
                }
            }
        }
    };
}

error_codes! {
    // Movement
    MoveInvalidDirection = "MOVE_INVALID_DIRECTION" => Validation,
    MoveCollisionDetected = "MOVE_COLLISION_DETECTED" => Validation,
    MoveRateLimited = "MOVE_RATE_LIMITED" => RateLimit,

    // Inventory
    InvInvalidSlot = "INV_INVALID_SLOT" => Validation,
    InvSlotEmpty = "INV_SLOT_EMPTY" => Validation,
    InvInsufficientQuantity = "INV_INSUFFICIENT_QUANTITY" => Validation,
    InvInventoryFull = "INV_INVENTORY_FULL" => Validation,
    InvInvalidSort = "INV_INVALID_SORT" => Validation,

    // Equipment
    EqInvalidSlot = "EQ_INVALID_SLOT" => Validation,
    EqItemNotEquipable = "EQ_ITEM_NOT_EQUIPABLE" => Validation,
    EqLevelTooLow = "EQ_LEVEL_TOO_LOW" => Validation,
    EqCannotUnequipFullInv = "EQ_CANNOT_UNEQUIP_FULL_INV" => Validation,

    // Ground items
    GroundItemNotFound = "GROUND_ITEM_NOT_FOUND" => Validation,
    GroundItemOutOfRange = "GROUND_ITEM_OUT_OF_RANGE" => Validation,

    // Combat
    CombatTargetInvalid = "COMBAT_TARGET_INVALID" => Business,
    CombatOutOfRange = "COMBAT_OUT_OF_RANGE" => Business,
    CombatAttackerDead = "COMBAT_ATTACKER_DEAD" => Business,
    CombatRateLimited = "COMBAT_RATE_LIMITED" => RateLimit,

    // Chat
    ChatInvalidChannel = "CHAT_INVALID_CHANNEL" => Validation,
    ChatMessageTooLong = "CHAT_MESSAGE_TOO_LONG" => Validation,
    ChatRecipientOffline = "CHAT_RECIPIENT_OFFLINE" => Validation,

    // Map queries
    MapInvalidCoords = "MAP_INVALID_COORDS" => Validation,
    MapChunkRadiusTooLarge = "MAP_CHUNK_RADIUS_TOO_LARGE" => Validation,

    // Auth / session
    AuthInvalidToken = "AUTH_INVALID_TOKEN" => Auth,
    AuthBanned = "AUTH_BANNED" => Auth,
    AuthTimedOut = "AUTH_TIMED_OUT" => Auth,
    AuthServerFull = "AUTH_SERVER_FULL" => Auth,

    // Admin
    AdminForbidden = "ADMIN_FORBIDDEN" => Validation,

    // Envelope
    MsgMalformed = "MSG_MALFORMED" => Validation,
    MsgUnknownType = "MSG_UNKNOWN_TYPE" => Validation,

    // Catch-all
    SysInternalError = "SYS_INTERNAL_ERROR" => System,
}

impl Encode for ErrorCode {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        VarInt(*self as i32).encode(w)
    }
}

impl Decode<'_> for ErrorCode {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let n = VarInt::decode(r)?.0;
        Self::ALL
            .get(n as usize)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("invalid error code tag {n}"))
    }
}
