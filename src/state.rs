// SPDX-License-Identifier: GPL-3.0-only

use calloop::{LoopHandle, LoopSignal};

use crate::{backend::kms::KmsState, config::Config};

pub struct State {
    pub config: Config,
    pub backend: KmsState,
    pub event_loop_handle: LoopHandle<'static, State>,
    pub loop_signal: LoopSignal,
}

impl State {
    pub fn new(
        config: Config,
        backend: KmsState,
        event_loop_handle: LoopHandle<'static, State>,
        loop_signal: LoopSignal,
    ) -> State {
        State {
            config,
            backend,
            event_loop_handle,
            loop_signal,
        }
    }
}
