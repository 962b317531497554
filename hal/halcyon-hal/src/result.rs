//! Result codes and the layered error type
//!
//! Every fallible driver call returns [`Result`]. The error is tagged by the
//! peripheral that produced it and wraps that peripheral's status enum. For
//! callers that need a single integer (logging, IPC, a C boundary) the error
//! packs into a [`ResultCode`]:
//!
//! ```text
//!  31  30 29                        16 15          8 7           0
//! ┌──────┬────────────────────────────┬─────────────┬─────────────┐
//! │ type │           module           │  submodule  │    code     │
//! └──────┴────────────────────────────┴─────────────┴─────────────┘
//! ```
//!
//! Zero is success.

use crate::adc::AdcError;
use crate::comp::CompError;
use crate::dma::DmaError;
use crate::gpio::GpioError;
use crate::hwmgr::HwmgrError;
use crate::i2s::I2sError;
use crate::pdmpcm::PdmPcmError;
use crate::rtc::RtcError;
use crate::sdio::SdioError;
use crate::spi::SpiError;
use crate::timer::TimerError;

/// Module identifier for errors raised by this HAL
pub const MODULE_HAL: u16 = 0x0100;

const TYPE_SHIFT: u32 = 30;
const MODULE_SHIFT: u32 = 16;
const MODULE_MASK: u32 = 0x3FFF;
const CODE_MASK: u32 = 0xFFFF;

/// Severity carried in the top two bits of a result code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ResultType {
    Info = 0,
    Warning = 1,
    Error = 2,
    Fatal = 3,
}

impl ResultType {
    const fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => ResultType::Info,
            1 => ResultType::Warning,
            2 => ResultType::Error,
            _ => ResultType::Fatal,
        }
    }
}

/// Packed result code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResultCode(u32);

impl ResultCode {
    /// The only success value
    pub const SUCCESS: Self = Self(0);

    /// Pack type, module and a 16-bit code
    pub const fn new(ty: ResultType, module: u16, code: u16) -> Self {
        Self(
            ((ty as u32) << TYPE_SHIFT)
                | ((module as u32 & MODULE_MASK) << MODULE_SHIFT)
                | (code as u32 & CODE_MASK),
        )
    }

    /// Pack with the code split into submodule (upper byte) and local code
    pub const fn new_ex(ty: ResultType, module: u16, submodule: u8, code: u8) -> Self {
        Self::new(ty, module, ((submodule as u16) << 8) | code as u16)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    pub const fn result_type(self) -> ResultType {
        ResultType::from_bits(self.0 >> TYPE_SHIFT)
    }

    pub const fn module(self) -> u16 {
        ((self.0 >> MODULE_SHIFT) & MODULE_MASK) as u16
    }

    pub const fn code(self) -> u16 {
        (self.0 & CODE_MASK) as u16
    }

    /// Upper byte of the code (extended form)
    pub const fn submodule(self) -> u8 {
        (self.code() >> 8) as u8
    }

    /// Lower byte of the code (extended form)
    pub const fn local_code(self) -> u8 {
        (self.code() & 0xFF) as u8
    }

    /// Recover the typed error from a code produced by [`Error::result_code`]
    ///
    /// Returns `None` for success, for foreign modules and for codes this
    /// HAL never emits.
    pub fn decode(self) -> Option<Error> {
        if self.is_success() || self.module() != MODULE_HAL {
            return None;
        }
        let local = self.local_code();
        let error = match PeripheralKind::from_submodule(self.submodule())? {
            PeripheralKind::Hwmgr => Error::Hwmgr(HwmgrError::from_code(local)?),
            PeripheralKind::Gpio => Error::Gpio(GpioError::from_code(local)?),
            PeripheralKind::Spi => Error::Spi(SpiError::from_code(local)?),
            PeripheralKind::I2s => Error::I2s(I2sError::from_code(local)?),
            PeripheralKind::Sdio => Error::Sdio(SdioError::from_code(local)?),
            PeripheralKind::Timer => Error::Timer(TimerError::from_code(local)?),
            PeripheralKind::Rtc => Error::Rtc(RtcError::from_code(local)?),
            PeripheralKind::Dma => Error::Dma(DmaError::from_code(local)?),
            PeripheralKind::PdmPcm => Error::PdmPcm(PdmPcmError::from_code(local)?),
            PeripheralKind::Adc => Error::Adc(AdcError::from_code(local)?),
            PeripheralKind::Comp => Error::Comp(CompError::from_code(local)?),
        };
        Some(error)
    }
}

/// Peripheral family that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PeripheralKind {
    Hwmgr = 0,
    Gpio = 1,
    Spi = 2,
    I2s = 3,
    Sdio = 4,
    Timer = 5,
    Rtc = 6,
    Dma = 7,
    PdmPcm = 8,
    Adc = 9,
    Comp = 10,
}

impl PeripheralKind {
    pub const fn submodule(self) -> u8 {
        self as u8
    }

    pub const fn from_submodule(value: u8) -> Option<Self> {
        match value {
            0 => Some(PeripheralKind::Hwmgr),
            1 => Some(PeripheralKind::Gpio),
            2 => Some(PeripheralKind::Spi),
            3 => Some(PeripheralKind::I2s),
            4 => Some(PeripheralKind::Sdio),
            5 => Some(PeripheralKind::Timer),
            6 => Some(PeripheralKind::Rtc),
            7 => Some(PeripheralKind::Dma),
            8 => Some(PeripheralKind::PdmPcm),
            9 => Some(PeripheralKind::Adc),
            10 => Some(PeripheralKind::Comp),
            _ => None,
        }
    }
}

/// Status classes shared by every peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StatusCode {
    /// A parameter was rejected before any hardware state changed
    InvalidArgument = 1,
    /// The resource is claimed by another handle
    InUse = 2,
    /// The handle was never initialized or has been freed
    NotInitialized = 3,
    /// The hardware cannot do what was asked
    Unsupported = 4,
    /// A conflicting operation is in progress
    Busy = 5,
    /// A blocking call ran out of time
    Timeout = 6,
    /// The hardware reported a fault
    TransferError = 7,
    /// The operation was cancelled
    Aborted = 8,
}

/// Declare a peripheral status enum
///
/// The generated enum carries the common [`StatusCode`] classes at codes
/// 1..=8 followed by the listed peripheral-specific variants, each mapped
/// to the class callers should treat it as.
macro_rules! peripheral_error {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal => $class:ident, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[cfg_attr(feature = "defmt", derive(defmt::Format))]
        #[repr(u8)]
        pub enum $name {
            InvalidArgument = 1,
            InUse = 2,
            NotInitialized = 3,
            Unsupported = 4,
            Busy = 5,
            Timeout = 6,
            TransferError = 7,
            Aborted = 8,
            $( $(#[$vmeta])* $variant = $code, )*
        }

        impl $name {
            /// Common class of this status
            pub const fn status(self) -> $crate::result::StatusCode {
                use $crate::result::StatusCode;
                match self {
                    Self::InvalidArgument => StatusCode::InvalidArgument,
                    Self::InUse => StatusCode::InUse,
                    Self::NotInitialized => StatusCode::NotInitialized,
                    Self::Unsupported => StatusCode::Unsupported,
                    Self::Busy => StatusCode::Busy,
                    Self::Timeout => StatusCode::Timeout,
                    Self::TransferError => StatusCode::TransferError,
                    Self::Aborted => StatusCode::Aborted,
                    $( Self::$variant => StatusCode::$class, )*
                }
            }

            /// Stable module-local code
            pub const fn code(self) -> u8 {
                self as u8
            }

            pub const fn from_code(code: u8) -> Option<Self> {
                match code {
                    1 => Some(Self::InvalidArgument),
                    2 => Some(Self::InUse),
                    3 => Some(Self::NotInitialized),
                    4 => Some(Self::Unsupported),
                    5 => Some(Self::Busy),
                    6 => Some(Self::Timeout),
                    7 => Some(Self::TransferError),
                    8 => Some(Self::Aborted),
                    $( $code => Some(Self::$variant), )*
                    _ => None,
                }
            }
        }

        impl From<$crate::result::StatusCode> for $name {
            fn from(status: $crate::result::StatusCode) -> Self {
                use $crate::result::StatusCode;
                match status {
                    StatusCode::InvalidArgument => Self::InvalidArgument,
                    StatusCode::InUse => Self::InUse,
                    StatusCode::NotInitialized => Self::NotInitialized,
                    StatusCode::Unsupported => Self::Unsupported,
                    StatusCode::Busy => Self::Busy,
                    StatusCode::Timeout => Self::Timeout,
                    StatusCode::TransferError => Self::TransferError,
                    StatusCode::Aborted => Self::Aborted,
                }
            }
        }
    };
}

pub(crate) use peripheral_error;

/// HAL error tagged by the peripheral that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    Hwmgr(HwmgrError),
    Gpio(GpioError),
    Spi(SpiError),
    I2s(I2sError),
    Sdio(SdioError),
    Timer(TimerError),
    Rtc(RtcError),
    Dma(DmaError),
    PdmPcm(PdmPcmError),
    Adc(AdcError),
    Comp(CompError),
}

impl Error {
    pub const fn kind(&self) -> PeripheralKind {
        match self {
            Error::Hwmgr(_) => PeripheralKind::Hwmgr,
            Error::Gpio(_) => PeripheralKind::Gpio,
            Error::Spi(_) => PeripheralKind::Spi,
            Error::I2s(_) => PeripheralKind::I2s,
            Error::Sdio(_) => PeripheralKind::Sdio,
            Error::Timer(_) => PeripheralKind::Timer,
            Error::Rtc(_) => PeripheralKind::Rtc,
            Error::Dma(_) => PeripheralKind::Dma,
            Error::PdmPcm(_) => PeripheralKind::PdmPcm,
            Error::Adc(_) => PeripheralKind::Adc,
            Error::Comp(_) => PeripheralKind::Comp,
        }
    }

    /// Common status class, independent of the peripheral
    pub const fn status(&self) -> StatusCode {
        match self {
            Error::Hwmgr(e) => e.status(),
            Error::Gpio(e) => e.status(),
            Error::Spi(e) => e.status(),
            Error::I2s(e) => e.status(),
            Error::Sdio(e) => e.status(),
            Error::Timer(e) => e.status(),
            Error::Rtc(e) => e.status(),
            Error::Dma(e) => e.status(),
            Error::PdmPcm(e) => e.status(),
            Error::Adc(e) => e.status(),
            Error::Comp(e) => e.status(),
        }
    }

    /// Peripheral-local code
    pub const fn code(&self) -> u8 {
        match self {
            Error::Hwmgr(e) => e.code(),
            Error::Gpio(e) => e.code(),
            Error::Spi(e) => e.code(),
            Error::I2s(e) => e.code(),
            Error::Sdio(e) => e.code(),
            Error::Timer(e) => e.code(),
            Error::Rtc(e) => e.code(),
            Error::Dma(e) => e.code(),
            Error::PdmPcm(e) => e.code(),
            Error::Adc(e) => e.code(),
            Error::Comp(e) => e.code(),
        }
    }

    pub const fn result_code(&self) -> ResultCode {
        ResultCode::new_ex(
            ResultType::Error,
            MODULE_HAL,
            self.kind().submodule(),
            self.code(),
        )
    }
}

impl From<Error> for ResultCode {
    fn from(error: Error) -> Self {
        error.result_code()
    }
}

impl<T> From<Result<T>> for ResultCode {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(_) => ResultCode::SUCCESS,
            Err(e) => e.result_code(),
        }
    }
}

macro_rules! impl_from_peripheral {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Error::$variant(e)
                }
            }
        )*
    };
}

impl_from_peripheral!(
    Hwmgr(HwmgrError),
    Gpio(GpioError),
    Spi(SpiError),
    I2s(I2sError),
    Sdio(SdioError),
    Timer(TimerError),
    Rtc(RtcError),
    Dma(DmaError),
    PdmPcm(PdmPcmError),
    Adc(AdcError),
    Comp(CompError),
);

impl embedded_hal::digital::Error for Error {
    fn kind(&self) -> embedded_hal::digital::ErrorKind {
        embedded_hal::digital::ErrorKind::Other
    }
}

/// Result type used by every driver
pub type Result<T, E = Error> = core::result::Result<T, E>;
