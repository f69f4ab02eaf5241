//! Result codes and error types
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use pvrt_kernel::ResultCode;
            /// assert_eq!(ResultCode::BadObjectState.as_str(), "BadObjectState");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the kernel can return.
    ///
    /// The error codes follow the μITRON4.0 numbering.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// A parameter is invalid in a way that is no covered by any other error
        /// codes.
        BadParam = -17,
        /// The specified object handle does not refer to a live object. A
        /// thread handle becomes stale once the thread's storage is reclaimed.
        NoAccess = -18,
        /// The current context disallows the operation.
        BadContext = -25,
        /// The allocator collaborator could not provide the memory needed to
        /// complete the operation.
        NoMemory = -33,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }
    };
}

define_error! {
    mod init_scheduler_error {}
    /// Error type for [`Scheduler::init`].
    ///
    /// [`Scheduler::init`]: crate::Scheduler::init
    pub enum InitSchedulerError {
        /// CPU Lock is active.
        BadContext,
        /// The idle thread's execution context couldn't be allocated.
        NoMemory,
        /// The scheduler has already been initialized.
        BadObjectState,
    }
}

define_error! {
    mod create_thread_error {}
    /// Error type for [`Scheduler::create`].
    ///
    /// [`Scheduler::create`]: crate::Scheduler::create
    pub enum CreateThreadError {
        /// CPU Lock is active.
        BadContext,
        /// The thread control block or the execution context couldn't be
        /// allocated. No thread was created.
        NoMemory,
    }
}

define_error! {
    mod get_current_thread_error {}
    /// Error type for [`Scheduler::current`].
    ///
    /// [`Scheduler::current`]: crate::Scheduler::current
    pub enum GetCurrentThreadError {
        /// CPU Lock is active, or the scheduler hasn't dispatched any thread
        /// yet.
        BadContext,
    }
}

define_error! {
    mod query_thread_error {}
    /// Error type for [`Scheduler::is_runnable`] and [`Scheduler::name`].
    ///
    /// [`Scheduler::is_runnable`]: crate::Scheduler::is_runnable
    /// [`Scheduler::name`]: crate::Scheduler::name
    pub enum QueryThreadError {
        /// The thread handle is stale.
        NoAccess,
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod block_thread_error {}
    /// Error type for [`Scheduler::block`].
    ///
    /// [`Scheduler::block`]: crate::Scheduler::block
    pub enum BlockThreadError {
        /// The thread handle is stale.
        NoAccess,
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod wake_thread_error {}
    /// Error type for [`Scheduler::wake`].
    ///
    /// [`Scheduler::wake`]: crate::Scheduler::wake
    pub enum WakeThreadError {
        /// The thread handle is stale.
        NoAccess,
        /// CPU Lock is active.
        BadContext,
        /// The thread has exited and is waiting to be reclaimed.
        BadObjectState,
    }
}

define_error! {
    mod sleep_error {}
    /// Error type for [`Scheduler::sleep`].
    ///
    /// [`Scheduler::sleep`]: crate::Scheduler::sleep
    pub enum SleepError {
        /// CPU Lock is active, the current context is an event handler, or
        /// no thread is running yet.
        BadContext,
    }
}

define_error! {
    mod bind_event_error {}
    /// Error type for [`EventChannels::bind`].
    ///
    /// [`EventChannels::bind`]: crate::EventChannels::bind
    pub enum BindEventError {
        /// CPU Lock is active.
        BadContext,
        /// The port number is not less than [`NR_EVS`].
        ///
        /// [`NR_EVS`]: crate::NR_EVS
        BadParam,
    }
}

define_error! {
    mod unbind_event_error {}
    /// Error type for [`EventChannels::unbind`].
    ///
    /// [`EventChannels::unbind`]: crate::EventChannels::unbind
    pub enum UnbindEventError {
        /// CPU Lock is active.
        BadContext,
        /// The port number is not less than [`NR_EVS`].
        ///
        /// [`NR_EVS`]: crate::NR_EVS
        BadParam,
    }
}

define_error! {
    mod query_event_error {}
    /// Error type for [`EventChannels::event_count`].
    ///
    /// [`EventChannels::event_count`]: crate::EventChannels::event_count
    pub enum QueryEventError {
        /// CPU Lock is active.
        BadContext,
        /// The port number is not less than [`NR_EVS`].
        ///
        /// [`NR_EVS`]: crate::NR_EVS
        BadParam,
    }
}

define_error! {
    mod install_policy_error {}
    /// Error type for [`State::install_dispatch_policy`].
    ///
    /// [`State::install_dispatch_policy`]: crate::State::install_dispatch_policy
    pub enum InstallPolicyError {
        /// A dispatch policy has already been installed.
        BadObjectState,
    }
}

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_suberror! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_suberror! {
    /// `BadContext`
    #[into(InitSchedulerError)]
    #[into(CreateThreadError)]
    #[into(GetCurrentThreadError)]
    #[into(QueryThreadError)]
    #[into(BlockThreadError)]
    #[into(WakeThreadError)]
    #[into(SleepError)]
    #[into(BindEventError)]
    #[into(UnbindEventError)]
    #[into(QueryEventError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `NoAccess`
    #[into(QueryThreadError)]
    #[into(BlockThreadError)]
    #[into(WakeThreadError)]
    pub(crate) enum NoAccessError {
        NoAccess,
    }
}

define_suberror! {
    /// `BadParam`
    #[into(BindEventError)]
    #[into(UnbindEventError)]
    #[into(QueryEventError)]
    pub(crate) enum BadParamError {
        BadParam,
    }
}

impl From<CreateThreadError> for InitSchedulerError {
    #[inline]
    fn from(x: CreateThreadError) -> Self {
        match x {
            CreateThreadError::BadContext => Self::BadContext,
            CreateThreadError::NoMemory => Self::NoMemory,
        }
    }
}
