// Copyright 2021 Locha Mesh Developers <contact@locha.io>
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

//! Simulated Z-Stack NCP answering the SYS NV commands.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use super::{sys::*, Frame, FrameScanner};
use crate::link::{mock::MockLink, Feed};

/// Bytes returned by one legacy read.
const READ_PAGE: usize = 240;

#[derive(Debug)]
pub(crate) struct ZnpSim {
    pub legacy: BTreeMap<u16, Vec<u8>>,
    pub extended: BTreeMap<(u16, u16), Vec<u8>>,
    /// Firmware without extended NV answers those commands with an RPC
    /// error.
    pub extended_supported: bool,
    /// SYS requests received, command ID and payload.
    pub requests: Vec<(u8, Vec<u8>)>,
}

impl Default for ZnpSim {
    fn default() -> Self {
        ZnpSim {
            legacy: BTreeMap::new(),
            extended: BTreeMap::new(),
            extended_supported: true,
            requests: Vec::new(),
        }
    }
}

fn read_reply(item: Option<&Vec<u8>>, offset: usize, count: usize) -> Vec<u8> {
    match item {
        Some(value) if offset <= value.len() => {
            let chunk = &value[offset..(offset + count).min(value.len())];
            let mut reply = vec![STATUS_SUCCESS, chunk.len() as u8];
            reply.extend_from_slice(chunk);
            reply
        }
        _ => vec![STATUS_NV_ITEM_UNINIT, 0],
    }
}

fn write_into(item: Option<&mut Vec<u8>>, offset: usize, value: &[u8]) -> Vec<u8> {
    match item {
        Some(item) if offset + value.len() <= item.len() => {
            item[offset..offset + value.len()].copy_from_slice(value);
            vec![STATUS_SUCCESS]
        }
        _ => vec![STATUS_NV_ITEM_EXISTS],
    }
}

fn status(ok: bool) -> Vec<u8> {
    vec![if ok { STATUS_SUCCESS } else { STATUS_NV_ITEM_UNINIT }]
}

impl ZnpSim {
    pub fn respond(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut scanner = FrameScanner::new();
        scanner.feed(data);

        let mut replies = Vec::new();
        while let Some(request) = scanner.try_extract_frame() {
            if request.cmd0 != SYS_SREQ {
                continue;
            }
            self.requests.push((request.cmd1, request.payload.clone()));

            let reply = match self.handle(request.cmd1, &request.payload) {
                Some(payload) => Frame::new(SYS_SRSP, request.cmd1, &payload),
                // RPC error, unsupported command.
                None => Frame::new(0x60, 0x00, &[0x02, request.cmd0, request.cmd1]),
            };
            replies.push(reply.encode().unwrap());
        }

        replies
    }

    fn handle(&mut self, cmd1: u8, p: &[u8]) -> Option<Vec<u8>> {
        let u16_at = |i: usize| u16::from_le_bytes([p[i], p[i + 1]]);
        let key = || (u16_at(1), u16_at(3));

        let reply = match cmd1 {
            SYS_PING => vec![0x79, 0x01],
            SYS_VERSION => {
                let mut reply = vec![2, 1, 2, 7, 1];
                reply.extend_from_slice(&20220219u32.to_le_bytes());
                reply
            }
            SYS_OSAL_NV_LENGTH => {
                let len = self.legacy.get(&u16_at(0)).map_or(0, |v| v.len() as u16);
                len.to_le_bytes().to_vec()
            }
            SYS_OSAL_NV_READ_EXT => {
                read_reply(self.legacy.get(&u16_at(0)), usize::from(u16_at(2)), READ_PAGE)
            }
            SYS_OSAL_NV_ITEM_INIT => {
                let (id, len) = (u16_at(0), u16_at(2));
                if self.legacy.contains_key(&id) {
                    vec![STATUS_SUCCESS]
                } else {
                    self.legacy.insert(id, vec![0; usize::from(len)]);
                    vec![STATUS_NV_ITEM_UNINIT]
                }
            }
            SYS_OSAL_NV_WRITE => {
                let len = usize::from(p[4]);
                write_into(
                    self.legacy.get_mut(&u16_at(0)),
                    usize::from(u16_at(2)),
                    &p[5..5 + len],
                )
            }
            SYS_OSAL_NV_DELETE => status(self.legacy.remove(&u16_at(0)).is_some()),
            SYS_NV_CREATE..=SYS_NV_WRITE if !self.extended_supported => return None,
            SYS_NV_LENGTH => {
                let len = self.extended.get(&key()).map_or(0, |v| v.len() as u32);
                len.to_le_bytes().to_vec()
            }
            SYS_NV_READ => read_reply(
                self.extended.get(&key()),
                usize::from(u16_at(5)),
                usize::from(p[7]),
            ),
            SYS_NV_CREATE => {
                let len = u32::from_le_bytes([p[5], p[6], p[7], p[8]]);
                if self.extended.contains_key(&key()) {
                    vec![STATUS_NV_ITEM_EXISTS]
                } else {
                    self.extended.insert(key(), vec![0; len as usize]);
                    vec![STATUS_SUCCESS]
                }
            }
            SYS_NV_DELETE => status(self.extended.remove(&key()).is_some()),
            SYS_NV_WRITE => {
                let len = usize::from(p[7]);
                write_into(
                    self.extended.get_mut(&key()),
                    usize::from(u16_at(5)),
                    &p[8..8 + len],
                )
            }
            _ => return None,
        };

        Some(reply)
    }
}

/// A mock link answered by `sim`.
pub(crate) fn link(sim: ZnpSim) -> (MockLink, Arc<Mutex<ZnpSim>>) {
    let sim = Arc::new(Mutex::new(sim));
    let responder = Arc::clone(&sim);
    let link = MockLink::with_responder(move |data| responder.lock().unwrap().respond(data));

    (link, sim)
}
