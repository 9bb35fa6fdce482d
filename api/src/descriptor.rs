//! Descriptors for every interceptable function.
//!
//! Tables are listed in slot order; a descriptor's slot is its index in the
//! native function-pointer table, and its offset is that slot times the
//! pointer width.

use std::ffi::c_void;
use std::fmt;

use crate::args::Shape;
use crate::ret::RetType;

/// Native function table that owns an API.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApiTable {
    /// Engine functions handed to the game module.
    Engine = 0,
    /// Game-module entity API (`GetEntityAPI`/`GetEntityAPI2`).
    Entity = 1,
    /// Game-module extension API (`GetNewDLLFunctions`).
    NewEntity = 2,
}

impl ApiTable {
    pub const ALL: [ApiTable; 3] = [ApiTable::Engine, ApiTable::Entity, ApiTable::NewEntity];

    /// Stable number used across the C boundary and in hook instantiations.
    pub const fn index(self) -> u8 {
        self as u8
    }

    pub const fn from_index(index: u8) -> Option<ApiTable> {
        match index {
            0 => Some(ApiTable::Engine),
            1 => Some(ApiTable::Entity),
            2 => Some(ApiTable::NewEntity),
            _ => None,
        }
    }
}

/// Stable identity of one API function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiId {
    pub table: ApiTable,
    pub slot: u16,
}

impl ApiId {
    pub const fn new(table: ApiTable, slot: u16) -> Self {
        Self { table, slot }
    }
}

impl fmt::Display for ApiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.table, self.slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiDescriptor {
    pub id: ApiId,
    pub name: &'static str,
    pub ret: RetType,
    pub shape: Shape,
    /// Byte offset of the function pointer inside its table.
    pub offset: usize,
}

const fn api(table: ApiTable, slot: u16, name: &'static str, ret: RetType, shape: Shape) -> ApiDescriptor {
    ApiDescriptor {
        id: ApiId::new(table, slot),
        name,
        ret,
        shape,
        offset: slot as usize * core::mem::size_of::<*const ()>(),
    }
}

macro_rules! hook_ptr {
    (Void / PPV, $table:literal, $slot:literal) => {
        None
    };
    (Void / IPV, $table:literal, $slot:literal) => {
        None
    };
    ($ret:ident / $shape:ident, $table:literal, $slot:literal) => {
        Some(crate::args::hooks::$shape::$ret::<$table, $slot> as *const c_void)
    };
}

macro_rules! api_table {
    ($descs:ident, $hooks:ident, $table:ident = $index:literal:
        $($slot:literal $name:ident $ret:ident / $shape:ident),* $(,)?) => {
        pub static $descs: &[ApiDescriptor] =
            &[$(api(ApiTable::$table, $slot, stringify!($name), RetType::$ret, Shape::$shape)),*];

        fn $hooks() -> Vec<Option<*const c_void>> {
            vec![$(hook_ptr!($ret / $shape, $index, $slot)),*]
        }
    };
}

api_table! { ENGINE_API, engine_hooks, Engine = 0:
    0 PrecacheModel Int/P,
    1 PrecacheSound Int/P,
    2 SetModel Void/PP,
    3 ModelIndex Int/P,
    4 ModelFrames Int/I,
    5 SetSize Void/PPP,
    6 ChangeLevel Void/PP,
    7 GetSpawnParms Void/P,
    8 SaveSpawnParms Void/P,
    9 VecToYaw Float/P,
    10 VecToAngles Void/PP,
    11 MoveToOrigin Void/PPFI,
    12 ChangeYaw Void/P,
    13 ChangePitch Void/P,
    14 FindEntityByString Ptr/PPP,
    15 GetEntityIllum Int/P,
    16 FindEntityInSphere Ptr/PPF,
    17 FindClientInPVS Ptr/P,
    18 EntitiesInPVS Ptr/P,
    19 MakeVectors Void/P,
    20 AngleVectors Void/PPPP,
    21 CreateEntity Ptr/Void,
    22 RemoveEntity Void/P,
    23 CreateNamedEntity Ptr/I,
    24 MakeStatic Void/P,
    25 EntIsOnFloor Int/P,
    26 DropToFloor Int/P,
    27 WalkMove Int/PFFI,
    28 SetOrigin Void/PP,
    29 EmitSound Void/PIPFFII,
    30 EmitAmbientSound Void/PPPFFII,
    31 TraceLine Void/PPIPP,
    32 TraceToss Void/PPP,
    33 TraceMonsterHull Int/PPPIPP,
    34 TraceHull Void/PPIIPP,
    35 TraceModel Void/PPIPP,
    36 TraceTexture Ptr/PPP,
    37 TraceSphere Void/PPIFPP,
    38 GetAimVector Void/PFP,
    39 ServerCommand Void/P,
    40 ServerExecute Void/Void,
    41 ClientCommand Void/PPV,
    42 ParticleEffect Void/PPFF,
    43 LightStyle Void/IP,
    44 DecalIndex Int/P,
    45 PointContents Int/P,
    46 MessageBegin Void/IIPP,
    47 MessageEnd Void/Void,
    48 WriteByte Void/I,
    49 WriteChar Void/I,
    50 WriteShort Void/I,
    51 WriteLong Void/I,
    52 WriteAngle Void/F,
    53 WriteCoord Void/F,
    54 WriteString Void/P,
    55 WriteEntity Void/I,
    56 CVarRegister Void/P,
    57 CVarGetFloat Float/P,
    58 CVarGetString Ptr/P,
    59 CVarSetFloat Void/PF,
    60 CVarSetString Void/PP,
    61 AlertMessage Void/IPV,
    62 EngineFprintf Void/PPV,
    63 PvAllocEntPrivateData Ptr/PI,
    64 PvEntPrivateData Ptr/P,
    65 FreeEntPrivateData Void/P,
    66 SzFromIndex Ptr/I,
    67 AllocString Int/P,
    68 GetVarsOfEnt Ptr/P,
    69 PEntityOfEntOffset Ptr/I,
    70 EntOffsetOfPEntity Int/P,
    71 IndexOfEdict Int/P,
    72 PEntityOfEntIndex Ptr/I,
    73 FindEntityByVars Ptr/P,
    74 GetModelPtr Ptr/P,
    75 RegUserMsg Int/PI,
    76 AnimationAutomove Void/PF,
    77 GetBonePosition Void/PIPP,
    78 FunctionFromName UInt/P,
    79 NameForFunction Ptr/U,
    80 ClientPrintf Void/PIP,
    81 ServerPrint Void/P,
    82 Cmd_Args Ptr/Void,
    83 Cmd_Argv Ptr/I,
    84 Cmd_Argc Int/Void,
    85 GetAttachment Void/PIPP,
    86 CRC32_Init Void/P,
    87 CRC32_ProcessBuffer Void/PPI,
    88 CRC32_ProcessByte Void/PU,
    89 CRC32_Final ULong/L,
    90 RandomLong Int/II,
    91 RandomFloat Float/FF,
    92 SetView Void/PP,
    93 Time Float/Void,
    94 CrosshairAngle Void/PFF,
    95 LoadFileForMe Ptr/PP,
    96 FreeFile Void/P,
    97 EndSection Void/P,
    98 CompareFileTime Int/PPP,
    99 GetGameDir Void/P,
    100 Cvar_RegisterVariable Void/P,
    101 FadeClientVolume Void/PIIII,
    102 SetClientMaxspeed Void/PF,
    103 CreateFakeClient Ptr/P,
    104 RunPlayerMove Void/PPFFFUUU,
    105 NumberOfEntities Int/Void,
    106 GetInfoKeyBuffer Ptr/P,
    107 InfoKeyValue Ptr/PP,
    108 SetKeyValue Void/PPP,
    109 SetClientKeyValue Void/IPPP,
    110 IsMapValid Int/P,
    111 StaticDecal Void/PIII,
    112 PrecacheGeneric Int/P,
    113 GetPlayerUserId Int/P,
    114 BuildSoundMsg Void/PIPFFIIIIPP,
    115 IsDedicatedServer Int/Void,
    116 CVarGetPointer Ptr/P,
    117 GetPlayerWONId UInt/P,
    118 Info_RemoveKey Void/PP,
    119 GetPhysicsKeyValue Ptr/PP,
    120 SetPhysicsKeyValue Void/PPP,
    121 GetPhysicsInfoString Ptr/P,
    122 PrecacheEvent UShort/IP,
    123 PlaybackEvent Void/IPUFPPFFIIII,
    124 SetFatPVS Ptr/P,
    125 SetFatPAS Ptr/P,
    126 CheckVisibility Int/PP,
    127 DeltaSetField Void/PP,
    128 DeltaUnsetField Void/PP,
    129 DeltaAddEncoder Void/PP,
    130 GetCurrentPlayer Int/Void,
    131 CanSkipPlayer Int/P,
    132 DeltaFindField Int/PP,
    133 DeltaSetFieldByIndex Void/PI,
    134 DeltaUnsetFieldByIndex Void/PI,
    135 SetGroupMask Void/II,
    136 CreateInstancedBaseline Int/IP,
    137 Cvar_DirectSet Void/PP,
    138 ForceUnmodified Void/IPPP,
    139 GetPlayerStats Void/PPP,
    140 AddServerCommand Void/PP,
    141 Voice_GetClientListening Int/II,
    142 Voice_SetClientListening Int/III,
    143 GetPlayerAuthId Ptr/P,
    144 SequenceGet Ptr/PP,
    145 SequencePickSentence Ptr/PIP,
    146 GetFileSize Int/P,
    147 GetApproxWavePlayLen UInt/P,
    148 IsCareerMatch Int/Void,
    149 GetLocalizedStringLength Int/P,
    150 RegisterTutorMessageShown Void/I,
    151 GetTimesTutorMessageShown Int/I,
    152 ProcessTutorMessageDecayBuffer Void/PI,
    153 ConstructTutorMessageDecayBuffer Void/PI,
    154 ResetTutorMessageDecayData Void/Void,
    155 QueryClientCvarValue Void/PP,
    156 QueryClientCvarValue2 Void/PPI,
    157 EngCheckParm Int/PP,
}

api_table! { ENTITY_API, entity_hooks, Entity = 1:
    0 GameInit Void/Void,
    1 Spawn Int/P,
    2 Think Void/P,
    3 Use Void/PP,
    4 Touch Void/PP,
    5 Blocked Void/PP,
    6 KeyValue Void/PP,
    7 Save Void/PP,
    8 Restore Int/PPI,
    9 SetAbsBox Void/P,
    10 SaveWriteFields Void/PPPPI,
    11 SaveReadFields Void/PPPPI,
    12 SaveGlobalState Void/P,
    13 RestoreGlobalState Void/P,
    14 ResetGlobalState Void/Void,
    15 ClientConnect Int/PPPP,
    16 ClientDisconnect Void/P,
    17 ClientKill Void/P,
    18 ClientPutInServer Void/P,
    19 ClientCommand Void/P,
    20 ClientUserInfoChanged Void/PP,
    21 ServerActivate Void/PII,
    22 ServerDeactivate Void/Void,
    23 PlayerPreThink Void/P,
    24 PlayerPostThink Void/P,
    25 StartFrame Void/Void,
    26 ParmsNewLevel Void/Void,
    27 ParmsChangeLevel Void/Void,
    28 GetGameDescription Ptr/Void,
    29 PlayerCustomization Void/PP,
    30 SpectatorConnect Void/P,
    31 SpectatorDisconnect Void/P,
    32 SpectatorThink Void/P,
    33 Sys_Error Void/P,
    34 PM_Move Void/PI,
    35 PM_Init Void/P,
    36 PM_FindTextureType Char/P,
    37 SetupVisibility Void/PPPP,
    38 UpdateClientData Void/PIP,
    39 AddToFullPack Int/PIPPIIP,
    40 CreateBaseline Void/IIPPIPP,
    41 RegisterEncoders Void/Void,
    42 GetWeaponData Int/PP,
    43 CmdStart Void/PPU,
    44 CmdEnd Void/P,
    45 ConnectionlessPacket Int/PPPP,
    46 GetHullBounds Int/IPP,
    47 CreateInstancedBaselines Void/Void,
    48 InconsistentFile Int/PPP,
    49 AllowLagCompensation Int/Void,
}

api_table! { NEW_ENTITY_API, new_entity_hooks, NewEntity = 2:
    0 OnFreeEntPrivateData Void/P,
    1 GameShutdown Void/Void,
    2 ShouldCollide Int/PP,
    3 CvarValue Void/PP,
    4 CvarValue2 Void/PIPP,
}

pub fn descriptors(table: ApiTable) -> &'static [ApiDescriptor] {
    match table {
        ApiTable::Engine => ENGINE_API,
        ApiTable::Entity => ENTITY_API,
        ApiTable::NewEntity => NEW_ENTITY_API,
    }
}

/// Native hook for every slot of `table`, in slot order. `None` where the
/// API is variadic and cannot be hooked.
pub fn hook_table(table: ApiTable) -> Vec<Option<*const c_void>> {
    match table {
        ApiTable::Engine => engine_hooks(),
        ApiTable::Entity => entity_hooks(),
        ApiTable::NewEntity => new_entity_hooks(),
    }
}

/// Number of function-pointer slots in `table`.
pub fn slot_count(table: ApiTable) -> usize {
    descriptors(table).len()
}

pub fn lookup(id: ApiId) -> Option<&'static ApiDescriptor> {
    descriptors(id.table).get(id.slot as usize)
}

pub fn find_by_name(table: ApiTable, name: &str) -> Option<&'static ApiDescriptor> {
    descriptors(table).iter().find(|d| d.name == name)
}
