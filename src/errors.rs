// Copyright 2022 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use thiserror::Error;

/// Base for HTTP errors from the update service: the reported code is
/// `HTTP_RESPONSE_BASE + status`.
pub const HTTP_RESPONSE_BASE: u32 = 2000;

/// High bits OR'd into a reported error code.  Stripped before
/// family classification.
pub const FLAG_DEV_MODE: u32 = 0x1000_0000;
pub const FLAG_RESUMED: u32 = 0x2000_0000;
pub const FLAG_TEST_IMAGE: u32 = 0x4000_0000;
pub const FLAG_TEST_OMAHA_URL: u32 = 0x8000_0000;

const ALL_FLAGS: u32 = FLAG_DEV_MODE | FLAG_RESUMED | FLAG_TEST_IMAGE | FLAG_TEST_OMAHA_URL;

/// Flat error space shared by every pipeline stage.  Numeric values are part
/// of the wire protocol (they're echoed back to the update service in error
/// events) and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    #[error("success")]
    Success,
    #[error("generic error")]
    Error,
    #[error("update-check request failed")]
    OmahaRequestError,
    #[error("update-service response could not be applied")]
    OmahaResponseHandlerError,
    #[error("post-install script failed")]
    PostinstallRunnerError,
    #[error("payload type does not match request")]
    PayloadMismatchedType,
    #[error("opening target partition device failed")]
    InstallDeviceOpenError,
    #[error("opening target kernel device failed")]
    KernelDeviceOpenError,
    #[error("payload transfer failed")]
    DownloadTransferError,
    #[error("payload hash mismatch")]
    PayloadHashMismatchError,
    #[error("payload size mismatch")]
    PayloadSizeMismatchError,
    #[error("payload signature verification failed")]
    DownloadPayloadVerificationError,
    #[error("target partition info missing from manifest")]
    DownloadNewPartitionInfoError,
    #[error("writing payload to disk failed")]
    DownloadWriteError,
    #[error("new rootfs verification failed")]
    NewRootfsVerificationError,
    #[error("new kernel verification failed")]
    NewKernelVerificationError,
    #[error("expected a signed payload")]
    SignedDeltaPayloadExpectedError,
    #[error("payload public-key verification failed")]
    DownloadPayloadPubKeyVerificationError,
    #[error("post-install: booted from firmware B")]
    PostinstallBootedFromFirmwareB,
    #[error("download state initialization failed")]
    DownloadStateInitializationError,
    #[error("bad payload magic")]
    DownloadInvalidMetadataMagicString,
    #[error("manifest parse failed")]
    DownloadManifestParseError,
    #[error("metadata signature verification failed")]
    DownloadMetadataSignatureError,
    #[error("metadata signature mismatch")]
    DownloadMetadataSignatureMismatch,
    #[error("operation hash verification failed")]
    DownloadOperationHashVerificationError,
    #[error("operation execution failed")]
    DownloadOperationExecutionError,
    #[error("operation hash mismatch")]
    DownloadOperationHashMismatch,
    #[error("empty response from update service")]
    OmahaRequestEmptyResponse,
    #[error("update-service response is not valid XML")]
    OmahaRequestXmlParseError,
    #[error("bad metadata size")]
    DownloadInvalidMetadataSize,
    #[error("bad metadata signature encoding")]
    DownloadInvalidMetadataSignature,
    #[error("update-service response invalid")]
    OmahaResponseInvalid,
    #[error("update ignored per policy")]
    OmahaUpdateIgnoredPerPolicy,
    #[error("update deferred per policy")]
    OmahaUpdateDeferredPerPolicy,
    #[error("HTTP error from update service")]
    OmahaErrorInHttpResponse,
    #[error("operation hash missing")]
    DownloadOperationHashMissingError,
    #[error("metadata signature missing")]
    DownloadMetadataSignatureMissingError,
    #[error("update deferred for backoff")]
    OmahaUpdateDeferredForBackoff,
    #[error("scheduling powerwash failed")]
    PostinstallPowerwashError,
    #[error("update canceled by channel change")]
    UpdateCanceledByChannelChange,
    #[error("post-install: RO firmware not updatable")]
    PostinstallFirmwareRONotUpdatable,
    #[error("unsupported payload major version")]
    UnsupportedMajorPayloadVersion,
    #[error("unsupported payload minor version")]
    UnsupportedMinorPayloadVersion,
    #[error("response contains an XML entity declaration")]
    OmahaRequestXmlHasEntityDecl,
    #[error("filesystem verification failed")]
    FilesystemVerifierError,
    #[error("canceled by user")]
    UserCanceled,
    #[error("non-critical update deferred until OOBE completes")]
    NonCriticalUpdateInOOBE,
    #[error("update over cellular requires permission")]
    OmahaUpdateIgnoredOverCellular,
    #[error("payload timestamp older than installed build")]
    PayloadTimestampError,
    #[error("updated but target slot not yet active")]
    UpdatedButNotActive,
    #[error("no update available")]
    NoUpdate,
    #[error("rollback not possible")]
    RollbackNotPossible,
    #[error("not enough space on target")]
    NotEnoughSpace,
    #[error("device corrupted")]
    DeviceCorrupted,
    #[error("package excluded from update")]
    PackageExcludedFromUpdate,
    #[error("HTTP {0} from update service")]
    OmahaRequestHttpResponse(u16),
}

impl ErrorCode {
    /// Stable numeric value, without flag bits.
    pub fn code(self) -> u32 {
        use ErrorCode::*;
        match self {
            Success => 0,
            Error => 1,
            OmahaRequestError => 2,
            OmahaResponseHandlerError => 3,
            PostinstallRunnerError => 5,
            PayloadMismatchedType => 6,
            InstallDeviceOpenError => 7,
            KernelDeviceOpenError => 8,
            DownloadTransferError => 9,
            PayloadHashMismatchError => 10,
            PayloadSizeMismatchError => 11,
            DownloadPayloadVerificationError => 12,
            DownloadNewPartitionInfoError => 13,
            DownloadWriteError => 14,
            NewRootfsVerificationError => 15,
            NewKernelVerificationError => 16,
            SignedDeltaPayloadExpectedError => 17,
            DownloadPayloadPubKeyVerificationError => 18,
            PostinstallBootedFromFirmwareB => 19,
            DownloadStateInitializationError => 20,
            DownloadInvalidMetadataMagicString => 21,
            DownloadManifestParseError => 23,
            DownloadMetadataSignatureError => 24,
            DownloadMetadataSignatureMismatch => 26,
            DownloadOperationHashVerificationError => 27,
            DownloadOperationExecutionError => 28,
            DownloadOperationHashMismatch => 29,
            OmahaRequestEmptyResponse => 30,
            OmahaRequestXmlParseError => 31,
            DownloadInvalidMetadataSize => 32,
            DownloadInvalidMetadataSignature => 33,
            OmahaResponseInvalid => 34,
            OmahaUpdateIgnoredPerPolicy => 35,
            OmahaUpdateDeferredPerPolicy => 36,
            OmahaErrorInHttpResponse => 37,
            DownloadOperationHashMissingError => 38,
            DownloadMetadataSignatureMissingError => 39,
            OmahaUpdateDeferredForBackoff => 40,
            PostinstallPowerwashError => 41,
            UpdateCanceledByChannelChange => 42,
            PostinstallFirmwareRONotUpdatable => 43,
            UnsupportedMajorPayloadVersion => 44,
            UnsupportedMinorPayloadVersion => 45,
            OmahaRequestXmlHasEntityDecl => 46,
            FilesystemVerifierError => 47,
            UserCanceled => 48,
            NonCriticalUpdateInOOBE => 49,
            OmahaUpdateIgnoredOverCellular => 50,
            PayloadTimestampError => 51,
            UpdatedButNotActive => 52,
            NoUpdate => 53,
            RollbackNotPossible => 54,
            NotEnoughSpace => 60,
            DeviceCorrupted => 61,
            PackageExcludedFromUpdate => 62,
            OmahaRequestHttpResponse(status) => HTTP_RESPONSE_BASE + status as u32,
        }
    }

    /// Wire value reported to the update service: numeric code OR'd with
    /// whatever flag bits apply to this build/attempt.
    pub fn to_wire(self, flags: u32) -> u32 {
        self.code() | (flags & ALL_FLAGS)
    }

    /// Split a wire value into (flags, bare code).
    pub fn strip_flags(wire: u32) -> (u32, u32) {
        (wire & ALL_FLAGS, wire & !ALL_FLAGS)
    }

    /// Transient transport and service errors: retried against the same
    /// response, advancing the URL after the per-URL failure cap.
    pub fn is_transient_download(self) -> bool {
        use ErrorCode::*;
        match self {
            DownloadTransferError | DownloadWriteError | OmahaErrorInHttpResponse => true,
            OmahaRequestHttpResponse(status) => (500..600).contains(&status),
            _ => false,
        }
    }

    /// Errors proving the payload at the current URL is damaged: the URL is
    /// advanced immediately and resume state for it is abandoned.
    pub fn is_payload_corruption(self) -> bool {
        use ErrorCode::*;
        matches!(
            self,
            PayloadHashMismatchError
                | PayloadSizeMismatchError
                | DownloadInvalidMetadataMagicString
                | DownloadInvalidMetadataSize
                | DownloadInvalidMetadataSignature
                | DownloadMetadataSignatureMismatch
                | DownloadMetadataSignatureMissingError
                | DownloadManifestParseError
                | DownloadOperationHashMismatch
                | DownloadOperationHashMissingError
                | DownloadPayloadPubKeyVerificationError
                | DownloadPayloadVerificationError
                | SignedDeltaPayloadExpectedError
                | UnsupportedMajorPayloadVersion
                | UnsupportedMinorPayloadVersion
        )
    }

    /// Policy deferrals: nothing about the payload or its URLs is wrong, so
    /// no counter may change.
    pub fn is_policy_defer(self) -> bool {
        use ErrorCode::*;
        matches!(
            self,
            OmahaUpdateIgnoredPerPolicy
                | OmahaUpdateDeferredPerPolicy
                | OmahaUpdateDeferredForBackoff
                | NonCriticalUpdateInOOBE
                | OmahaUpdateIgnoredOverCellular
        )
    }
}
