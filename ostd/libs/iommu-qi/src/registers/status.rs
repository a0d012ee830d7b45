// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;

bitflags! {
    /// Global Status of the IOMMU. All fields are read-only. Each status bit reports the
    /// outcome of the field with the same position in `GlobalCommand`.
    pub struct GlobalStatus: u32 {
        /// Compatibility Format Interrupt Status.
        const CFIS =        1 << 23;
        /// Interrupt Remapping Table Pointer Status.
        const IRTPS =       1 << 24;
        /// Interrupt Remapping Enable Status.
        const IRES =        1 << 25;
        /// Queued Invalidation Enable Status.
        ///
        /// - 0: queued invalidation is not enabled.
        /// - 1: queued invalidation is enabled.
        const QIES =        1 << 26;
        /// Write Buffer Flush Status.
        const WBFS =        1 << 27;
        /// Root Table Pointer Status.
        const RTPS =        1 << 30;
        /// Translation Enable Status.
        const TES =         1 << 31;
    }
}

bitflags! {
    /// Global Command of the IOMMU. The register is write-only.
    ///
    /// Software changes one field at a time: it reads `GlobalStatus`, clears
    /// the one-shot bits, updates the field of interest, and writes the result.
    pub struct GlobalCommand: u32 {
        /// Compatibility Format Interrupt.
        const CFI =         1 << 23;
        /// Set Interrupt Remap Table Pointer. One-shot.
        const SIRTP =       1 << 24;
        /// Interrupt Remapping Enable.
        const IRE =         1 << 25;
        /// Queued Invalidation Enable.
        ///
        /// The invalidation queue address register must be programmed before
        /// setting this bit. Clearing it makes the hardware reset the queue
        /// head to zero.
        const QIE =         1 << 26;
        /// Write Buffer Flush. One-shot.
        const WBF =         1 << 27;
        /// Enable Advanced Fault Logging.
        const EAFL =        1 << 28;
        /// Set Fault Log. One-shot.
        const SFL =         1 << 29;
        /// Set Root Table Pointer. One-shot.
        const SRTP =        1 << 30;
        /// Translation Enable.
        const TE =          1 << 31;
    }
}

impl GlobalCommand {
    /// The commands that take effect once per write and must not be repeated
    /// when another field is updated.
    pub const ONE_SHOT: Self = Self::SIRTP
        .union(Self::WBF)
        .union(Self::SFL)
        .union(Self::SRTP);

    /// Derives the command that keeps every persistent field as `status`
    /// reports it.
    pub fn persistent_from(status: GlobalStatus) -> Self {
        Self::from_bits_truncate(status.bits()).difference(Self::ONE_SHOT)
    }
}

bitflags! {
    /// Invalidation Completion Status.
    pub struct CompletionStatus: u32 {
        /// Invalidation Wait Descriptor Complete. Set by hardware when a wait
        /// descriptor with the interrupt flag completes. Write 1 to clear.
        const IWC =         1 << 0;
    }
}

bitflags! {
    /// Invalidation Event Control.
    pub struct EventControl: u32 {
        /// Interrupt Pending. Read-only. Set while a completion event could not
        /// be delivered because it was masked.
        const IP =          1 << 30;
        /// Interrupt Mask.
        const IM =          1 << 31;
    }
}
