// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use custom_error::custom_error;
use kthreads::KthreadError;

custom_error! {
    #[derive(PartialEq, Clone)]
    pub MltpError
    OutOfMemory = "Unable to allocate a thread stack.",
    InvalidVpCount = "Need at least one virtual processor to run threads.",
    Kernel{source: KthreadError} = "Kernel thread layer failure",
}
